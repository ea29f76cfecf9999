//! Snapshot persistence: one file for retained messages, one for sessions
//! plus their subscriptions.
//!
//! Both files share the same envelope: an 8-byte magic, a little-endian
//! format version, then length-prefixed bincode records. State is collected
//! under the store's read lock and serialized after the lock is released;
//! files are written to a `.new` sibling and renamed into place. Loading is
//! best-effort: a missing file is a warning, not a failure.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{MqttError, Result};
use crate::retain::{RetainedMessage, RetainedMessageStore};
use crate::session::SubscriptionStore;
use crate::topic::Filter;
use crate::types::{Publish, QoS};

const RETAINED_MAGIC: [u8; 8] = *b"EMBRMQRT";
const SESSIONS_MAGIC: [u8; 8] = *b"EMBRMQSS";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: String,
    pub clean_session: bool,
    pub pending: Vec<Publish>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub topic_filter: String,
    pub entries: Vec<(String, QoS)>,
}

/// Saves the retained-message store. Returns the number of entries written.
pub async fn save_retained<P: AsRef<Path>>(store: &RetainedMessageStore, path: P) -> Result<usize> {
    let path = path.as_ref();
    log::info!("saving retained messages to '{}'", path.display());

    let messages = store.snapshot().await;
    log::debug!("collected {} retained messages to save", messages.len());

    let mut buf = header(RETAINED_MAGIC);
    encode_section(&mut buf, &messages)?;
    write_file(path, buf).await?;
    Ok(messages.len())
}

/// Loads the retained-message snapshot, if present.
pub async fn load_retained<P: AsRef<Path>>(store: &RetainedMessageStore, path: P) -> Result<usize> {
    let path = path.as_ref();
    log::info!("loading '{}'", path.display());

    let Some(data) = read_file(path).await? else {
        return Ok(0);
    };
    let mut reader = Reader::new(&data, RETAINED_MAGIC)?;
    let messages: Vec<RetainedMessage> = decode_section(&mut reader)?;

    let count = messages.len();
    store.restore(messages).await;
    Ok(count)
}

/// Saves every session (deep copy, pending queue included) and the
/// flattened subscription table.
pub async fn save_sessions<P: AsRef<Path>>(store: &SubscriptionStore, path: P) -> Result<(usize, usize)> {
    let path = path.as_ref();
    log::info!("saving sessions and subscriptions to '{}'", path.display());

    let (sessions, subscriptions) = store.snapshot_state().await;

    let session_records: Vec<SessionRecord> = sessions
        .into_iter()
        .map(|(client_id, clean_session, pending)| SessionRecord {
            client_id: client_id.to_string(),
            clean_session,
            pending,
        })
        .collect();

    // Group the flat (filter, client, qos) rows by filter.
    let mut by_filter: std::collections::BTreeMap<String, Vec<(String, QoS)>> = Default::default();
    for (topic_filter, client_id, qos) in subscriptions {
        by_filter.entry(topic_filter).or_default().push((client_id.to_string(), qos));
    }
    let subscription_records: Vec<SubscriptionRecord> = by_filter
        .into_iter()
        .map(|(topic_filter, entries)| SubscriptionRecord { topic_filter, entries })
        .collect();

    log::debug!(
        "collected {} sessions and {} subscriptions to save",
        session_records.len(),
        subscription_records.len()
    );

    let mut buf = header(SESSIONS_MAGIC);
    encode_section(&mut buf, &session_records)?;
    encode_section(&mut buf, &subscription_records)?;
    write_file(path, buf).await?;
    Ok((session_records.len(), subscription_records.len()))
}

/// Loads the session snapshot, if present. Subscriptions naming a client id
/// absent from the session table are dropped.
pub async fn load_sessions<P: AsRef<Path>>(store: &SubscriptionStore, path: P) -> Result<(usize, usize)> {
    let path = path.as_ref();
    log::info!("loading '{}'", path.display());

    let Some(data) = read_file(path).await? else {
        return Ok((0, 0));
    };
    let mut reader = Reader::new(&data, SESSIONS_MAGIC)?;
    let session_records: Vec<SessionRecord> = decode_section(&mut reader)?;
    let subscription_records: Vec<SubscriptionRecord> = decode_section(&mut reader)?;

    let sessions = session_records.len();
    for record in session_records {
        store.restore_session(record.client_id.into(), record.clean_session, record.pending).await;
    }

    let mut subscriptions = 0;
    for record in subscription_records {
        let filter: Filter = match record.topic_filter.parse() {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping restored subscription on '{}': {e}", record.topic_filter);
                continue;
            }
        };
        for (client_id, qos) in record.entries {
            if store.restore_subscription(&client_id, &filter, qos).await {
                subscriptions += 1;
            } else {
                log::debug!(
                    "dropping subscription to '{}' for unknown client '{client_id}'",
                    record.topic_filter
                );
            }
        }
    }

    Ok((sessions, subscriptions))
}

fn header(magic: [u8; 8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4096);
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf
}

fn encode_section<T: Serialize>(buf: &mut Vec<u8>, records: &[T]) -> Result<()> {
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        let body = bincode::serialize(record)?;
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
    }
    Ok(())
}

fn decode_section<T: DeserializeOwned>(reader: &mut Reader<'_>) -> Result<Vec<T>> {
    let count = reader.u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let len = reader.u32()? as usize;
        let body = reader.take(len)?;
        out.push(bincode::deserialize(body)?);
    }
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], magic: [u8; 8]) -> Result<Reader<'a>> {
        let mut reader = Reader { data, at: 0 };
        if reader.take(8)? != &magic[..] {
            return Err(MqttError::Persistence("unrecognized snapshot file magic".into()));
        }
        let version = reader.u32()?;
        if version != FORMAT_VERSION {
            return Err(MqttError::Persistence(format!("unsupported snapshot version {version}")));
        }
        Ok(reader)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .at
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| MqttError::Persistence("truncated snapshot file".into()))?;
        let out = &self.data[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

async fn write_file(path: &Path, buf: Vec<u8>) -> Result<()> {
    let tmp = path.with_extension("new");
    tokio::fs::write(&tmp, &buf).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("file '{}' is not there (yet)", path.display());
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connection;
    use crate::stats::Stats;
    use crate::types::Payload;
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> SubscriptionStore {
        SubscriptionStore::new(Arc::new(Stats::new()), 64, 16)
    }

    #[tokio::test]
    async fn retained_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retained.db");

        let original = RetainedMessageStore::new();
        original.set(&"home/light".into(), Payload::from("on"), QoS::AtLeastOnce).await.unwrap();
        original.set(&"$SYS/version".into(), Payload::from("1"), QoS::AtMostOnce).await.unwrap();

        assert_eq!(save_retained(&original, &path).await.unwrap(), 2);

        let restored = RetainedMessageStore::new();
        assert_eq!(load_retained(&restored, &path).await.unwrap(), 2);
        assert_eq!(restored.count(), 2);

        let mut out = Vec::new();
        restored
            .fetch_for_subscribe(&"home/+".parse().unwrap(), QoS::ExactlyOnce, |t, p, q| {
                out.push((t.to_string(), p.to_vec(), q));
            })
            .await;
        assert_eq!(out, vec![("home/light".to_string(), b"on".to_vec(), QoS::AtLeastOnce)]);
    }

    #[tokio::test]
    async fn missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let retained = RetainedMessageStore::new();
        assert_eq!(load_retained(&retained, dir.path().join("none.db")).await.unwrap(), 0);
        let sessions = store();
        assert_eq!(load_sessions(&sessions, dir.path().join("none.db")).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.db");
        tokio::fs::write(&path, b"not a snapshot").await.unwrap();
        assert!(load_retained(&RetainedMessageStore::new(), &path).await.is_err());
    }

    #[tokio::test]
    async fn sessions_round_trip_with_pending_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let original = store();
        let (conn, rx) = Connection::new(1, "k".into(), false, Duration::from_secs(60));
        original.register(&conn).await.unwrap();
        original.add_subscription("k", &"t/+".parse().unwrap(), QoS::AtLeastOnce).await.unwrap();
        drop(rx);
        drop(conn);
        original.publish(&Publish::new("t/x", "m1", QoS::AtLeastOnce)).await;

        assert_eq!(save_sessions(&original, &path).await.unwrap(), (1, 1));

        let restored = store();
        assert_eq!(load_sessions(&restored, &path).await.unwrap(), (1, 1));
        assert!(restored.session_present("k").await);

        // The queued message survived and flushes to a fresh connection.
        let (conn, mut rx) = Connection::new(2, "k".into(), false, Duration::from_secs(60));
        let out = restored.register(&conn).await.unwrap();
        assert!(out.session_present);
        assert_eq!(out.flushed, 1);
        match rx.try_recv() {
            Ok(crate::types::Message::Forward(p)) => assert_eq!(&p.payload[..], b"m1"),
            other => panic!("expected a forwarded publish, got {other:?}"),
        }

        // The restored subscription still routes.
        assert_eq!(restored.publish(&Publish::new("t/y", "m2", QoS::AtMostOnce)).await, 1);
    }

    #[tokio::test]
    async fn unknown_client_subscriptions_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        // Hand-build a snapshot whose subscription table names a client that
        // has no session record.
        let mut buf = header(SESSIONS_MAGIC);
        let sessions = vec![SessionRecord {
            client_id: "known".into(),
            clean_session: false,
            pending: Vec::new(),
        }];
        let subscriptions = vec![SubscriptionRecord {
            topic_filter: "a/b".into(),
            entries: vec![("known".into(), QoS::AtMostOnce), ("ghost".into(), QoS::AtLeastOnce)],
        }];
        encode_section(&mut buf, &sessions).unwrap();
        encode_section(&mut buf, &subscriptions).unwrap();
        tokio::fs::write(&path, &buf).await.unwrap();

        let restored = store();
        assert_eq!(load_sessions(&restored, &path).await.unwrap(), (1, 1));
        assert!(restored.session_present("known").await);
        assert!(!restored.session_present("ghost").await);
    }
}
