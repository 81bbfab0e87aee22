//! Flattening of node announcements.

use std::sync::Arc;

use plinth_constraint::FlatMap;

use crate::bus::{Message, PipeFn};

/// Pipe function turning `{"node-1": "{\"advertise\": ...}"}` into
/// `{"node-1.advertise": ...}`.
///
/// Values that are not JSON objects are kept as they are. Non-string JSON
/// fields are rendered as JSON.
pub fn nodes_pipe() -> PipeFn {
    Arc::new(|message: Message| {
        let mut data = FlatMap::new();
        for (node, raw) in message.data {
            match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw) {
                Ok(fields) => {
                    for (field, value) in fields {
                        let value = match value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        data.insert(format!("{node}.{field}"), value);
                    }
                }
                Err(_) => {
                    data.insert(node, raw);
                }
            }
        }
        Message { data, ..message }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_pipe_flattens_announcements() {
        let pipe = nodes_pipe();
        let message = Message::clean(
            "nodes",
            FlatMap::from([
                (
                    "node-1".to_string(),
                    r#"{"advertise":"10.0.0.1:7654","api":"v1","ready":true}"#.to_string(),
                ),
                ("legacy".to_string(), "plain".to_string()),
            ]),
        );

        let res = pipe(message);
        assert!(res.clean);
        assert_eq!(res.prefix, "nodes");
        assert_eq!(res.data["node-1.advertise"], "10.0.0.1:7654");
        assert_eq!(res.data["node-1.api"], "v1");
        assert_eq!(res.data["node-1.ready"], "true");
        assert_eq!(res.data["legacy"], "plain");
    }

    #[test]
    fn test_nodes_pipe_keeps_dirty_state() {
        let res = nodes_pipe()(Message::dirty("nodes"));
        assert_eq!(res, Message::dirty("nodes"));
    }
}
