use crate::interest::command::DEFAULT_COMMAND_CAPACITY;
use crate::interest::ids::MAX_HANDLER_SLOTS;
use crate::interest::spatial::DEFAULT_CELL_SIZE;

/// Interest manager configuration
#[derive(Debug, Clone)]
pub struct InterestConfig {
    /// Spatial grid cell size for proximity handlers (world units)
    pub grid_cell_size: f32,
    /// Attributes spanning more grid cells than this skip bucketing
    pub max_cells_per_attribute: u64,
    /// Rule queries spanning more grid cells than this scan all attributes
    pub max_query_cells: u64,
    /// Maximum handler slots (at most 32)
    pub max_handlers: usize,
    /// Capacity of the cross-thread command queue
    pub command_queue_capacity: usize,
    /// Run dirty handler slots on the rayon pool
    pub parallel_handlers: bool,
    /// Log a pass summary every N passes (0 = never)
    pub stats_interval: u64,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            grid_cell_size: DEFAULT_CELL_SIZE,
            max_cells_per_attribute: 64,
            max_query_cells: 4096,
            max_handlers: MAX_HANDLER_SLOTS,
            command_queue_capacity: DEFAULT_COMMAND_CAPACITY,
            parallel_handlers: true,
            stats_interval: 300,
        }
    }
}

impl InterestConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("INTEREST_GRID_CELL_SIZE") {
            match size.parse::<f32>() {
                Ok(parsed) if parsed.is_finite() && parsed > 0.0 => config.grid_cell_size = parsed,
                Ok(_) => tracing::warn!("INTEREST_GRID_CELL_SIZE must be > 0, using default"),
                Err(_) => tracing::warn!("Invalid INTEREST_GRID_CELL_SIZE '{}', using default", size),
            }
        }

        if let Ok(max) = std::env::var("INTEREST_MAX_HANDLERS") {
            match max.parse::<usize>() {
                Ok(parsed) if parsed > 0 && parsed <= MAX_HANDLER_SLOTS => config.max_handlers = parsed,
                Ok(_) => tracing::warn!(
                    "INTEREST_MAX_HANDLERS must be 1-{}, using default",
                    MAX_HANDLER_SLOTS
                ),
                Err(_) => tracing::warn!("Invalid INTEREST_MAX_HANDLERS '{}', using default", max),
            }
        }

        if let Ok(capacity) = std::env::var("INTEREST_COMMAND_QUEUE_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.command_queue_capacity = parsed,
                Ok(_) => tracing::warn!("INTEREST_COMMAND_QUEUE_CAPACITY must be > 0, using default"),
                Err(_) => tracing::warn!(
                    "Invalid INTEREST_COMMAND_QUEUE_CAPACITY '{}', using default",
                    capacity
                ),
            }
        }

        if let Ok(parallel) = std::env::var("INTEREST_PARALLEL_HANDLERS") {
            match parallel.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.parallel_handlers = true,
                "0" | "false" | "no" => config.parallel_handlers = false,
                _ => tracing::warn!("Invalid INTEREST_PARALLEL_HANDLERS '{}', using default", parallel),
            }
        }

        if let Ok(interval) = std::env::var("INTEREST_STATS_INTERVAL") {
            if let Ok(parsed) = interval.parse::<u64>() {
                config.stats_interval = parsed;
            } else {
                tracing::warn!("Invalid INTEREST_STATS_INTERVAL '{}', using default", interval);
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !self.grid_cell_size.is_finite() || self.grid_cell_size <= 0.0 {
            return Err("grid_cell_size must be a positive number".to_string());
        }
        if self.max_handlers == 0 || self.max_handlers > MAX_HANDLER_SLOTS {
            return Err(format!("max_handlers must be 1-{}", MAX_HANDLER_SLOTS));
        }
        if self.command_queue_capacity == 0 {
            return Err("command_queue_capacity must be at least 1".to_string());
        }
        if self.max_cells_per_attribute == 0 || self.max_query_cells == 0 {
            return Err("grid cell limits must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Settings for the `interest-sim` binary
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Simulated peers, each with one sphere rule and one tag rule
    pub peers: u32,
    /// Simulated replicas moving around the world
    pub replicas: u64,
    /// Matching passes per second
    pub tick_rate: u32,
    /// Half-width of the square world (world units)
    pub world_radius: f32,
    /// Radius of every peer's view sphere
    pub view_radius: f32,
    /// Prometheus/JSON endpoint port
    pub metrics_port: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 16,
            replicas: 2000,
            tick_rate: 30,
            world_radius: 1000.0,
            view_radius: 150.0,
            metrics_port: 9090,
        }
    }
}

impl SimConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(peers) = std::env::var("SIM_PEERS") {
            if let Ok(parsed) = peers.parse() {
                config.peers = parsed;
            } else {
                tracing::warn!("Invalid SIM_PEERS '{}', using default", peers);
            }
        }

        if let Ok(replicas) = std::env::var("SIM_REPLICAS") {
            if let Ok(parsed) = replicas.parse() {
                config.replicas = parsed;
            } else {
                tracing::warn!("Invalid SIM_REPLICAS '{}', using default", replicas);
            }
        }

        if let Ok(rate) = std::env::var("SIM_TICK_RATE") {
            match rate.parse::<u32>() {
                Ok(parsed) if parsed > 0 => config.tick_rate = parsed,
                _ => tracing::warn!("Invalid SIM_TICK_RATE '{}', using default", rate),
            }
        }

        if let Ok(radius) = std::env::var("SIM_WORLD_RADIUS") {
            match radius.parse::<f32>() {
                Ok(parsed) if parsed.is_finite() && parsed > 0.0 => config.world_radius = parsed,
                _ => tracing::warn!("Invalid SIM_WORLD_RADIUS '{}', using default", radius),
            }
        }

        if let Ok(radius) = std::env::var("SIM_VIEW_RADIUS") {
            match radius.parse::<f32>() {
                Ok(parsed) if parsed.is_finite() && parsed >= 0.0 => config.view_radius = parsed,
                _ => tracing::warn!("Invalid SIM_VIEW_RADIUS '{}', using default", radius),
            }
        }

        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(parsed) = port.parse() {
                config.metrics_port = parsed;
            } else {
                tracing::warn!("Invalid METRICS_PORT '{}', using default", port);
            }
        }

        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err("tick_rate must be 1-1000".to_string());
        }
        if !self.world_radius.is_finite() || self.world_radius <= 0.0 {
            return Err("world_radius must be a positive number".to_string());
        }
        if !self.view_radius.is_finite() || self.view_radius < 0.0 {
            return Err("view_radius must be >= 0".to_string());
        }
        Ok(())
    }
}
