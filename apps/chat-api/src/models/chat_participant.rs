use diesel::prelude::*;

/// A chat member as seen by the realtime core: just enough to address
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Queryable)]
pub struct ChatParticipant {
    pub user_id: String,
    pub username: String,
}
