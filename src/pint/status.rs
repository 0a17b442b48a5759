/// Step context handed to the integrator.
#[derive(Debug, Clone, Copy)]
pub struct StepStatus {
    pub t_start: f64,
    pub t_stop: f64,
    /// Multigrid level, 0 being the finest.
    pub level: usize,
}

impl StepStatus {
    pub fn is_finest(&self) -> bool {
        self.level == 0
    }
}

/// Context for the observation hook.
#[derive(Debug, Clone, Copy)]
pub struct AccessStatus {
    pub t: f64,
    pub level: usize,
    pub done: bool,
}
