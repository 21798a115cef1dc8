//! Cluster control commands: CN label updates and commit-timestamp sync.

use async_trait::async_trait;
use tidal_common::{Result, TidalError};
use tidal_engine::Timestamp;

/// Parsed CN label parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnLabel {
    /// Target CN uuid.
    pub uuid: String,
    /// Label key.
    pub key: String,
    /// Label values.
    pub values: Vec<String>,
}

fn is_uuid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse a label command parameter. Accepted forms:
/// `cn:key:value` and `cn:key:[v1,v2,...]`.
pub fn parse_cn_label(param: &str) -> Result<CnLabel> {
    let bad = || {
        TidalError::Plan("format is: cn:key:value or cn:key:[v1,v2,...]".to_string())
    };
    let mut parts = param.splitn(3, ':');
    let uuid = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
    let key = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
    let value = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;
    if !uuid.chars().all(is_uuid_char) || !key.chars().all(is_word_char) {
        return Err(bad());
    }

    let values = if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let values: Vec<String> = inner.split(',').map(|v| v.to_string()).collect();
        if values.is_empty() || values.iter().any(|v| v.is_empty()) {
            return Err(bad());
        }
        values
    } else {
        vec![value.to_string()]
    };
    if values.iter().any(|v| !v.chars().all(is_word_char)) {
        return Err(bad());
    }
    Ok(CnLabel {
        uuid: uuid.to_string(),
        key: key.to_string(),
        values,
    })
}

/// Per-CN commit-timestamp control surface.
#[async_trait]
pub trait CommitTsService: Send + Sync {
    /// Current commit timestamp of one CN.
    async fn get_commit(&self, cn: &str) -> Result<Timestamp>;
    /// Push the latest commit timestamp to one CN.
    async fn sync_commit(&self, cn: &str, ts: Timestamp) -> Result<()>;
}

/// Gather every CN's commit timestamp, push the maximum back to all, and
/// report the result.
pub async fn handle_sync_commit(
    service: &dyn CommitTsService,
    cns: &[String],
) -> Result<String> {
    let mut max_commit_ts = Timestamp::default();
    for cn in cns {
        let ts = service.get_commit(cn).await?;
        if max_commit_ts < ts {
            max_commit_ts = ts;
        }
    }
    for cn in cns {
        service.sync_commit(cn, max_commit_ts).await?;
    }
    Ok(format!(
        "sync {} cn services's commit ts to {}",
        cns.len(),
        max_commit_ts
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[test]
    fn parses_single_value_labels() {
        let label = parse_cn_label("cn-1:workload:olap").expect("parse");
        assert_eq!(label.uuid, "cn-1");
        assert_eq!(label.key, "workload");
        assert_eq!(label.values, vec!["olap".to_string()]);
    }

    #[test]
    fn parses_multi_value_labels() {
        let label = parse_cn_label("cn_2:tier:[hot,warm,cold]").expect("parse");
        assert_eq!(label.values.len(), 3);
        assert_eq!(label.values[2], "cold");
    }

    #[test]
    fn rejects_malformed_labels() {
        for bad in [
            "cn-1",
            "cn-1:key",
            "cn 1:key:value",
            "cn-1:key:[a,,b]",
            "cn-1:key:[]",
            "cn-1:ke y:v",
        ] {
            assert!(parse_cn_label(bad).is_err(), "{bad} should fail");
        }
    }

    struct FakeCtl {
        commits: HashMap<String, Timestamp>,
        pushed: Mutex<Vec<(String, Timestamp)>>,
    }

    #[async_trait]
    impl CommitTsService for FakeCtl {
        async fn get_commit(&self, cn: &str) -> Result<Timestamp> {
            Ok(self.commits[cn])
        }

        async fn sync_commit(&self, cn: &str, ts: Timestamp) -> Result<()> {
            self.pushed.lock().push((cn.to_string(), ts));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_commit_pushes_the_maximum() {
        let cns = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut commits = HashMap::new();
        commits.insert(
            "a".to_string(),
            Timestamp {
                physical: 5,
                logical: 0,
            },
        );
        commits.insert(
            "b".to_string(),
            Timestamp {
                physical: 9,
                logical: 2,
            },
        );
        commits.insert(
            "c".to_string(),
            Timestamp {
                physical: 9,
                logical: 1,
            },
        );
        let ctl = FakeCtl {
            commits,
            pushed: Mutex::new(Vec::new()),
        };
        let reply = handle_sync_commit(&ctl, &cns).await.expect("sync");
        assert_eq!(reply, "sync 3 cn services's commit ts to 9-2");
        let pushed = ctl.pushed.lock();
        assert_eq!(pushed.len(), 3);
        assert!(pushed.iter().all(|(_, ts)| ts.physical == 9 && ts.logical == 2));
    }
}
