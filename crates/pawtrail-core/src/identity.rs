/// The authenticated user as supplied by the identity collaborator.
/// The core never authenticates anyone itself; it only reacts to
/// login/logout transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub handle: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handle: handle.into(),
        }
    }
}
