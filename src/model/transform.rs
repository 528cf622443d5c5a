use ndarray::{s, Array4, ArrayView3, ArrayView4, Axis};
use rayon::prelude::*;

/// Transformation de point de vue: chaque pose d'entrée fois chaque matrice de type.
///
/// `poses` est `(N, B', P²)` et `weights` est `(Bw, C, P, P)`. Sans partage
/// `B' == Bw`; avec partage les poids sont répétés le long de l'axe d'entrée et
/// la ligne `i` utilise le poids `i % Bw` (entrées rangées position puis type).
/// Retourne les votes de forme `(N, B', C, P²)`.
pub fn viewpoint_transform(
    poses: &ArrayView3<f32>,
    weights: &ArrayView4<f32>,
    w_shared: bool,
) -> Array4<f32> {
    let (n, num_inputs, psize) = poses.dim();
    let (weight_rows, num_out, p, p2) = weights.dim();
    assert_eq!(p, p2, "transformation matrices must be square");
    assert_eq!(psize, p * p, "pose size {psize} does not match {p}x{p} weights");
    if w_shared {
        assert!(
            weight_rows > 0 && num_inputs % weight_rows == 0,
            "{num_inputs} inputs cannot tile {weight_rows} shared weights"
        );
    } else {
        assert_eq!(
            num_inputs, weight_rows,
            "one weight per input capsule expected without sharing"
        );
    }

    let mut votes = Array4::<f32>::zeros((n, num_inputs, num_out, psize));

    votes
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(sample, mut sample_votes)| {
            let pose = poses.index_axis(Axis(0), sample);
            for i in 0..num_inputs {
                let wi = i % weight_rows;
                for c in 0..num_out {
                    for row in 0..p {
                        for col in 0..p {
                            let mut sum = 0.0;
                            for k in 0..p {
                                sum += pose[[i, row * p + k]] * weights[[wi, c, k, col]];
                            }
                            sample_votes[[i, c, row * p + col]] = sum;
                        }
                    }
                }
            }
        });

    votes
}

/// Addition des coordonnées normalisées pour la couche de classes partagée.
///
/// `votes` est `(b, H·W·B, C, P²)` avec les entrées rangées `(ligne, colonne, type)`.
/// Ajoute `row / H` à l'entrée 0 de la pose et `col / W` à l'entrée 1.
pub fn add_coordinates(votes: &mut Array4<f32>, height: usize, width: usize, num_types: usize) {
    assert_eq!(height, width, "coordinate addition needs a square grid, got {height}x{width}");
    let (_, num_inputs, _, psize) = votes.dim();
    assert_eq!(
        num_inputs,
        height * width * num_types,
        "votes do not cover a {height}x{width} grid of {num_types} capsule types"
    );
    assert!(psize >= 2, "coordinate addition needs at least two pose entries");

    for i in 0..num_inputs {
        let cell = i / num_types;
        let row = cell / width;
        let col = cell % width;

        let mut entry = votes.slice_mut(s![.., i, .., 0]);
        entry += row as f32 / height as f32;
        let mut entry = votes.slice_mut(s![.., i, .., 1]);
        entry += col as f32 / width as f32;
    }
}
