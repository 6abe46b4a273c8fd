use uuid::Uuid;

/// A replication group: a named set of backends with at most one master.
/// Relations to other groups (which group this one replicates from, which
/// groups replicate from it) live in the catalog, keyed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    pub description: String,
    pub master: Option<Uuid>,
    /// Active groups are watched by the failure detector.
    pub active: bool,
}

impl Group {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            master: None,
            active: false,
        }
    }

    pub fn has_master(&self) -> bool {
        self.master.is_some()
    }

    pub fn is_master(&self, uuid: &Uuid) -> bool {
        self.master.as_ref() == Some(uuid)
    }
}
