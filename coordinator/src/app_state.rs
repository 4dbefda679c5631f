use crate::coordinator::Coordinator;

pub struct AppState {
    pub coordinator: Coordinator,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}
