use crate::{business::BusinessService, element::ResourceManager};

/// State of the storage, account and order roles.
pub struct ParticipantState {
    pub manager: ResourceManager,
}

/// State of the business role.
pub struct BusinessState {
    pub service: BusinessService,
}
