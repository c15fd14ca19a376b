//! Change notifications emitted by the store when rows are inserted.

use crate::ids::{MessageId, ProposalId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ChangeNotification {
    MessageInserted(MessageId),
    ProposalInserted(ProposalId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_wire_shape() {
        let n = ChangeNotification::MessageInserted(MessageId::new("m-1"));
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "message_inserted", "id": "m-1"}));

        let back: ChangeNotification =
            serde_json::from_str(r#"{"kind":"proposal_inserted","id":"p-2"}"#).unwrap();
        assert_eq!(back, ChangeNotification::ProposalInserted(ProposalId::new("p-2")));
    }
}
