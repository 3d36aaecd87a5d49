//! Fraud cluster and cluster membership queries.

use super::{opt_from_millis, opt_millis, ThreatStore};
use crate::{
    error::EngineResult,
    threat::{ClusterPattern, FraudCluster, PatternType},
    types::{from_millis, Timestamp},
};
use rusqlite::{params, OptionalExtension};

const CLUSTER_COLUMNS: &str =
    "id, label, score, severity, threat_count, pattern_type, metadata, created_at";

type ClusterRaw = (String, String, String, i64, i64, String, String, i64);

fn read_cluster(r: &rusqlite::Row<'_>) -> rusqlite::Result<ClusterRaw> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
    ))
}

fn into_cluster(raw: ClusterRaw) -> EngineResult<FraudCluster> {
    let (id, label, score, severity, threat_count, pattern_type, metadata, created_at) = raw;
    Ok(FraudCluster {
        id,
        label,
        score,
        severity: severity.clamp(1, 5) as u8,
        threat_count: threat_count.max(0) as usize,
        pattern_type: PatternType::parse(&pattern_type)?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: from_millis(created_at),
    })
}

impl ThreatStore {
    /// Insert a cluster and all of its membership links in one transaction.
    pub fn insert_cluster_with_patterns(
        &self,
        cluster: &FraudCluster,
        patterns: &[ClusterPattern],
    ) -> EngineResult<()> {
        let metadata = serde_json::to_string(&cluster.metadata)?;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO fraud_cluster (
                id, label, score, severity, threat_count, pattern_type, metadata, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                cluster.id,
                cluster.label,
                cluster.score,
                cluster.severity as i64,
                cluster.threat_count as i64,
                cluster.pattern_type.as_str(),
                metadata,
                cluster.created_at.timestamp_millis(),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO cluster_pattern (
                    cluster_id, event_id, ip_address, user_agent, device_fingerprint,
                    timestamp, similarity
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for p in patterns {
                stmt.execute(params![
                    p.cluster_id,
                    p.event_id,
                    p.ip_address,
                    p.user_agent,
                    p.device_fingerprint,
                    opt_millis(p.timestamp),
                    p.similarity,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_cluster(&self, cluster_id: &str) -> EngineResult<Option<FraudCluster>> {
        let raw = self
            .conn()
            .query_row(
                &format!("SELECT {CLUSTER_COLUMNS} FROM fraud_cluster WHERE id = ?1"),
                params![cluster_id],
                read_cluster,
            )
            .optional()?;
        raw.map(into_cluster).transpose()
    }

    /// Clusters created at or after `since`, oldest first.
    pub fn clusters_created_since(&self, since: Timestamp) -> EngineResult<Vec<FraudCluster>> {
        let raws = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {CLUSTER_COLUMNS} FROM fraud_cluster
                 WHERE created_at >= ?1 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map(params![since.timestamp_millis()], read_cluster)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raws.into_iter().map(into_cluster).collect()
    }

    pub fn count_clusters_since(&self, since: Timestamp) -> EngineResult<i64> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM fraud_cluster WHERE created_at >= ?1",
            params![since.timestamp_millis()],
            |r| r.get(0),
        )?)
    }

    pub fn count_clusters(&self) -> EngineResult<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM fraud_cluster", [], |r| r.get(0))?)
    }

    pub fn cluster_patterns(&self, cluster_id: &str) -> EngineResult<Vec<ClusterPattern>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT cluster_id, event_id, ip_address, user_agent, device_fingerprint,
                    timestamp, similarity
             FROM cluster_pattern WHERE cluster_id = ?1 ORDER BY id ASC",
        )?;
        let patterns = stmt
            .query_map(params![cluster_id], |r| {
                Ok(ClusterPattern {
                    cluster_id:         r.get(0)?,
                    event_id:           r.get(1)?,
                    ip_address:         r.get(2)?,
                    user_agent:         r.get(3)?,
                    device_fingerprint: r.get(4)?,
                    timestamp:          opt_from_millis(r.get(5)?),
                    similarity:         r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(patterns)
    }
}
