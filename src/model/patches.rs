//! Extraction des patchs de capsules par fenêtre glissante.
//!
//! Extraction valide (sans padding), sans somme de convolution: chaque
//! position de sortie reçoit une copie exacte du bloc K×K de capsules
//! d'entrée dont le coin supérieur gauche est en `(i * stride, j * stride)`.

use ndarray::{s, Array6, ArrayView4};

/// Taille spatiale d'une fenêtre glissante valide: `(size - kernel) / stride + 1`.
pub fn output_size(size: usize, kernel_size: usize, stride: usize) -> usize {
    assert!(stride > 0, "stride must be positive");
    assert!(
        size >= kernel_size,
        "kernel {kernel_size} does not fit in spatial size {size}"
    );
    (size - kernel_size) / stride + 1
}

/// Rassemble les fenêtres K×K d'une grille de capsules compacte.
///
/// Entrée `(b, H, W, B·(P²+1))` avec `H == W`, sortie
/// `(b, H', W', K, K, B·(P²+1))` et le côté de sortie `H' = W'`.
pub fn extract_patches(
    x: &ArrayView4<f32>,
    num_types: usize,
    kernel_size: usize,
    psize: usize,
    stride: usize,
) -> (Array6<f32>, usize) {
    let (batch_size, height, width, channels) = x.dim();
    assert_eq!(height, width, "capsule grid must be square, got {height}x{width}");
    assert_eq!(
        channels,
        num_types * (psize + 1),
        "expected {num_types} capsule types of pose size {psize}"
    );

    let out_size = output_size(height, kernel_size, stride);
    let mut patches = Array6::<f32>::zeros((
        batch_size,
        out_size,
        out_size,
        kernel_size,
        kernel_size,
        channels,
    ));

    for i in 0..out_size {
        let row = i * stride;
        for j in 0..out_size {
            let col = j * stride;
            patches
                .slice_mut(s![.., i, j, .., .., ..])
                .assign(&x.slice(s![.., row..row + kernel_size, col..col + kernel_size, ..]));
        }
    }

    (patches, out_size)
}
