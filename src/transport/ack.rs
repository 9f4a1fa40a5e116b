//! Acknowledgement body encoding
//!
//! One form-encoded body carries the outcome of every batch in a
//! delivery: `batch-<id>=ok` or `batch-<id>=<failed row>`, plus optional
//! `nodeId-<id>`, `network-<id>`, `filter-<id>`, `database-<id>`,
//! `byteCount-<id>`, `sqlState-<id>`, `sqlCode-<id>` and `sqlMessage-<id>`
//! details.

use std::collections::HashMap;

use tracing::debug;
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::model::BatchAck;

const BATCH: &str = "batch-";
const NODE_ID: &str = "nodeId-";
const NETWORK: &str = "network-";
const FILTER: &str = "filter-";
const DATABASE: &str = "database-";
const BYTE_COUNT: &str = "byteCount-";
const SQL_STATE: &str = "sqlState-";
const SQL_CODE: &str = "sqlCode-";
const SQL_MESSAGE: &str = "sqlMessage-";

const OK: &str = "ok";

/// Encode acks into one form body
pub fn encode_acks(acks: &[BatchAck]) -> String {
    let mut body = form_urlencoded::Serializer::new(String::new());
    for ack in acks {
        let id = ack.batch_id;
        if ack.ok {
            body.append_pair(&format!("{}{}", BATCH, id), OK);
        } else {
            body.append_pair(&format!("{}{}", BATCH, id), &ack.error_line.to_string());
        }
        if let Some(node_id) = &ack.node_id {
            body.append_pair(&format!("{}{}", NODE_ID, id), node_id);
        }
        body.append_pair(&format!("{}{}", NETWORK, id), &ack.network_millis.to_string());
        body.append_pair(&format!("{}{}", FILTER, id), &ack.filter_millis.to_string());
        body.append_pair(&format!("{}{}", DATABASE, id), &ack.database_millis.to_string());
        body.append_pair(&format!("{}{}", BYTE_COUNT, id), &ack.byte_count.to_string());
        if !ack.ok {
            if let Some(state) = &ack.sql_state {
                body.append_pair(&format!("{}{}", SQL_STATE, id), state);
            }
            body.append_pair(&format!("{}{}", SQL_CODE, id), &ack.sql_code.to_string());
            if let Some(message) = &ack.sql_message {
                body.append_pair(&format!("{}{}", SQL_MESSAGE, id), message);
            }
        }
    }
    body.finish()
}

/// Parse an ack body.
///
/// Detail pairs may come before or after their `batch-` pair. Acks are
/// returned in the order their `batch-` pairs appear; details for batches
/// without one and unknown keys are dropped.
pub fn parse_acks(body: &str) -> Result<Vec<BatchAck>> {
    let mut order = Vec::new();
    let mut acks: HashMap<i64, BatchAck> = HashMap::new();
    let mut details: Vec<(String, i64, String)> = Vec::new();

    for (key, value) in form_urlencoded::parse(body.trim().as_bytes()) {
        let Some((prefix, id)) = split_key(&key) else {
            debug!("Ignoring acknowledgement key '{}'", key);
            continue;
        };
        if prefix == BATCH {
            let mut ack = if value.trim().eq_ignore_ascii_case(OK) {
                BatchAck::ok(id)
            } else {
                let line = value.trim().parse::<i64>().map_err(|_| {
                    Error::Transport(format!("invalid status '{}' for batch {}", value, id))
                })?;
                BatchAck::error(id, line)
            };
            if let Some(previous) = acks.remove(&id) {
                ack.node_id = previous.node_id;
            } else {
                order.push(id);
            }
            acks.insert(id, ack);
        } else {
            details.push((prefix.to_string(), id, value.into_owned()));
        }
    }

    for (prefix, id, value) in details {
        let Some(ack) = acks.get_mut(&id) else {
            continue;
        };
        match prefix.as_str() {
            NODE_ID => ack.node_id = Some(value),
            NETWORK => ack.network_millis = number(&value),
            FILTER => ack.filter_millis = number(&value),
            DATABASE => ack.database_millis = number(&value),
            BYTE_COUNT => ack.byte_count = number(&value),
            SQL_STATE => ack.sql_state = Some(value),
            SQL_CODE => ack.sql_code = number(&value) as i32,
            SQL_MESSAGE => ack.sql_message = Some(value),
            _ => {}
        }
    }

    Ok(order.into_iter().filter_map(|id| acks.remove(&id)).collect())
}

fn split_key(key: &str) -> Option<(&'static str, i64)> {
    [
        BATCH, NODE_ID, NETWORK, FILTER, DATABASE, BYTE_COUNT, SQL_STATE, SQL_CODE, SQL_MESSAGE,
    ]
    .into_iter()
    .find_map(|prefix| {
        key.strip_prefix(prefix)
            .and_then(|id| id.parse::<i64>().ok())
            .map(|id| (prefix, id))
    })
}

fn number(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_ok_and_error() {
        let mut failed = BatchAck::error(8, 3);
        failed.node_id = Some("001".into());
        failed.sql_code = 1555;
        failed.sql_message = Some("UNIQUE constraint failed: item.id".into());
        let body = encode_acks(&[BatchAck::ok(7), failed]);

        assert!(body.starts_with("batch-7=ok&"));
        assert!(body.contains("batch-8=3"));
        assert!(body.contains("nodeId-8=001"));
        assert!(body.contains("sqlMessage-8=UNIQUE+constraint+failed%3A+item.id"));
        assert!(!body.contains("sqlCode-7"));
    }

    #[test]
    fn test_parse_detail_before_batch() {
        let acks = parse_acks("nodeId-4=002&sqlMessage-4=bad%20row&batch-4=2&batch-5=ok&extra=1").unwrap();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].batch_id, 4);
        assert!(!acks[0].ok);
        assert_eq!(acks[0].error_line, 2);
        assert_eq!(acks[0].node_id.as_deref(), Some("002"));
        assert_eq!(acks[0].sql_message.as_deref(), Some("bad row"));
        assert!(acks[1].ok);
    }

    #[test]
    fn test_decoded_body_matches_acks() {
        let mut failed = BatchAck::error(12, 0);
        failed.node_id = Some("store-1".into());
        failed.sql_state = Some("ConstraintViolation".into());
        failed.sql_code = 19;
        failed.sql_message = Some("a=b&c".into());
        failed.database_millis = 40;
        let mut ok = BatchAck::ok(11);
        ok.node_id = Some("store-1".into());
        ok.byte_count = 512;

        let acks = vec![ok, failed];
        assert_eq!(parse_acks(&encode_acks(&acks)).unwrap(), acks);
    }

    #[test]
    fn test_invalid_status() {
        assert!(parse_acks("batch-1=maybe").is_err());
        assert!(parse_acks("").unwrap().is_empty());
    }
}
