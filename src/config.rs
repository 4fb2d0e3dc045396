use thiserror::Error;

/// Hard cap on plies in a self-play game; longer games score as draws.
pub const MAX_GAME_PLIES: usize = 512;

/// Positions with more legal moves than this are never cached, and the
/// expansion branch list is truncated to this many moves when a cache store
/// is planned so the cache and the tree agree.
pub const MAX_CACHE_MOVES: usize = 56;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("prediction cache size must be a power-of-two GiB or zero, got {0}")]
    CacheSizeNotPowerOfTwo(u64),
    #[error("prediction cache size limited to 256 GiB, got {0}")]
    CacheSizeTooLarge(u64),
    #[error("prediction cache minimum {min} GiB exceeds request {request} GiB")]
    CacheMinAboveRequest { request: u64, min: u64 },
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("search_threads must be at least 1")]
    NoSearchThreads,
    #[error("prediction_batch_size must be at least 1")]
    NoSlots,
}

/// All tunable knobs, UCI-visible and otherwise. Defaults are playable.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    // Self-play.
    pub num_simulations: u32,
    pub num_sampling_moves: u32,
    pub root_dirichlet_alpha: f32,
    pub root_exploration_fraction: f32,

    // Threads and slots.
    pub search_threads: usize,
    pub prediction_batch_size: usize,
    pub selfplay_workers: usize,

    // Prediction cache.
    pub cache_gib: u64,
    pub cache_min_gib: u64,
    pub cache_max_ply: u32,

    // PUCT.
    pub c_puct_init: f32,
    pub c_puct_base: f32,
    pub linear_rate: f32,
    pub linear_delay: f32,
    pub virtual_loss_coefficient: f32,
    pub elimination_base_exponent: f32,
    pub backpropagation_puct_threshold: f32,
    pub fpu_root: f32,
    pub fpu_default: f32,

    // Value averaging and endgame handling.
    pub moving_average_build: f32,
    pub moving_average_cap: u32,
    pub progress_decay_divisor: f32,
    pub endgame_material_max: u32,

    // Move selection diversity (search mode).
    pub move_diversity_plies: u32,
    pub move_diversity_temperature: f32,
    pub move_diversity_delta: f32,

    // Early-search throttling.
    pub slowstart_nodes: u32,
    pub slowstart_threads: usize,
    pub slowstart_parallelism: usize,

    // Game-clock policy.
    pub time_control_fraction_of_remaining: f32,
    pub absolute_minimum_ms: u64,
    pub safety_buffer_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            num_simulations: 800,
            num_sampling_moves: 30,
            root_dirichlet_alpha: 0.3,
            root_exploration_fraction: 0.25,

            search_threads: 4,
            prediction_batch_size: 128,
            selfplay_workers: 4,

            cache_gib: 2,
            cache_min_gib: 1,
            cache_max_ply: 40,

            c_puct_init: 1.25,
            c_puct_base: 19652.0,
            linear_rate: 40.0,
            linear_delay: 10.0,
            virtual_loss_coefficient: 1.0,
            elimination_base_exponent: 2.0,
            backpropagation_puct_threshold: 0.05,
            fpu_root: 0.0,
            fpu_default: 0.3,

            moving_average_build: 2.0,
            moving_average_cap: 500,
            progress_decay_divisor: 100.0,
            endgame_material_max: 12,

            move_diversity_plies: 10,
            move_diversity_temperature: 2.0,
            move_diversity_delta: 0.05,

            slowstart_nodes: 1000,
            slowstart_threads: 2,
            slowstart_parallelism: 4,

            time_control_fraction_of_remaining: 0.035,
            absolute_minimum_ms: 50,
            safety_buffer_ms: 100,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for &gib in &[self.cache_gib, self.cache_min_gib] {
            if gib > 256 {
                return Err(ConfigError::CacheSizeTooLarge(gib));
            }
            if gib != 0 && !gib.is_power_of_two() {
                return Err(ConfigError::CacheSizeNotPowerOfTwo(gib));
            }
        }
        if self.cache_min_gib > self.cache_gib {
            return Err(ConfigError::CacheMinAboveRequest {
                request: self.cache_gib,
                min: self.cache_min_gib,
            });
        }
        if self.search_threads == 0 {
            return Err(ConfigError::NoSearchThreads);
        }
        if self.prediction_batch_size == 0 {
            return Err(ConfigError::NoSlots);
        }
        let positives: [(&'static str, f64); 6] = [
            ("c_puct_base", self.c_puct_base as f64),
            ("linear_rate", self.linear_rate as f64),
            ("linear_delay", self.linear_delay as f64),
            ("moving_average_build", self.moving_average_build as f64),
            ("progress_decay_divisor", self.progress_decay_divisor as f64),
            ("move_diversity_temperature", self.move_diversity_temperature as f64),
        ];
        for (name, value) in positives {
            if value <= 0.0 {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_cache() {
        let mut o = EngineOptions::default();
        o.cache_gib = 3;
        o.cache_min_gib = 0;
        assert!(matches!(
            o.validate(),
            Err(ConfigError::CacheSizeNotPowerOfTwo(3))
        ));
    }

    #[test]
    fn rejects_min_above_request() {
        let mut o = EngineOptions::default();
        o.cache_gib = 1;
        o.cache_min_gib = 2;
        assert!(o.validate().is_err());
    }
}
