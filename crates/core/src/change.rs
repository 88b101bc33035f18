use mirrordb_value::{Key, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One effective change to a collection's visible state.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeMessage {
    pub kind: ChangeKind,
    pub key: Key,
    /// The row after the change; for deletes, the row that was removed.
    pub value: Value,
    pub previous_value: Option<Value>,
    pub metadata: Option<Value>,
}

impl ChangeMessage {
    pub fn insert(key: Key, value: Value) -> Self {
        ChangeMessage {
            kind: ChangeKind::Insert,
            key,
            value,
            previous_value: None,
            metadata: None,
        }
    }

    pub fn update(key: Key, value: Value, previous: Value) -> Self {
        ChangeMessage {
            kind: ChangeKind::Update,
            key,
            value,
            previous_value: Some(previous),
            metadata: None,
        }
    }

    pub fn delete(key: Key, value: Value) -> Self {
        ChangeMessage {
            kind: ChangeKind::Delete,
            key,
            value,
            previous_value: None,
            metadata: None,
        }
    }
}

/// Merge two changes to the same key observed within one batch into the
/// single change a subscriber should see. `None` means they cancel out.
///
/// Delete-then-insert becomes an update, matching how a retract/insert pair
/// from a keyed pipeline or a truncate-and-resend reconciles.
pub fn merge_changes(first: &ChangeMessage, second: &ChangeMessage) -> Option<ChangeMessage> {
    use ChangeKind::*;
    match (first.kind, second.kind) {
        (Delete, Insert) | (Delete, Update) => {
            if first.value == second.value {
                // Net zero: the row came back identical.
                None
            } else {
                Some(ChangeMessage::update(
                    second.key.clone(),
                    second.value.clone(),
                    first.value.clone(),
                ))
            }
        }
        (Insert, Delete) => None,
        (Update, Delete) => Some(ChangeMessage::delete(
            second.key.clone(),
            first.previous_value.clone().unwrap_or_else(|| first.value.clone()),
        )),
        (Insert, Update) => Some(ChangeMessage::insert(second.key.clone(), second.value.clone())),
        (Update, Update) => Some(ChangeMessage::update(
            second.key.clone(),
            second.value.clone(),
            first.previous_value.clone().unwrap_or_else(|| first.value.clone()),
        )),
        (Update, Insert) | (Insert, Insert) | (Delete, Delete) => {
            log::warn!("unexpected {:?} after {:?} for key `{}` within one batch", second.kind, first.kind, second.key);
            Some(second.clone())
        }
    }
}
