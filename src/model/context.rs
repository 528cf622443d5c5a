//! Contexte de calcul explicite.
//!
//! Le pool de threads des noyaux numériques et la source d'aléa de
//! l'initialisation vivent ici. Le contexte est passé à la construction des
//! couches et à chaque appel de forward.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

use super::error::{CapsResult, CapsuleError};

#[derive(Debug, Clone)]
pub struct ComputeContext {
    seed: u64,
    pool: Option<Arc<ThreadPool>>,
}

impl ComputeContext {
    /// Contexte CPU sur le pool rayon global
    pub fn cpu(seed: u64) -> Self {
        Self { seed, pool: None }
    }

    /// Contexte CPU avec un pool dédié de `num_threads` threads
    pub fn with_threads(seed: u64, num_threads: usize) -> CapsResult<Self> {
        if num_threads == 0 {
            return Err(CapsuleError::invalid_config("num_threads must be positive"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| CapsuleError::invalid_config(format!("thread pool: {e}")))?;

        Ok(Self {
            seed,
            pool: Some(Arc::new(pool)),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Exécute `op` sur les threads de ce contexte
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Générateur déterministe propre à un consommateur, indépendant des autres tirages
    pub fn rng(&self, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        rng
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::cpu(0)
    }
}
