//! Dream synthesis.
//!
//! The dream loop fetches recent memories, groups them by cosine
//! similarity of their stored embeddings, and asks the model registry for
//! a one-paragraph synthesis of each cluster of three or more. Clustering
//! is greedy against each cluster's first member, which keeps the pass
//! deterministic for a given memory ordering.

use std::sync::Arc;

use tracing::{debug, info, warn};

use sos_gateway::ModelRequest;
use sos_memory::MemoryRecord;
use sos_runtime::Services;

/// Dream-loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct DreamConfig {
    /// Memories fetched per pass.
    pub fetch_limit: usize,
    /// Cosine similarity threshold τ for cluster membership.
    pub similarity_threshold: f32,
    /// Minimum cluster size that produces a dream.
    pub min_cluster_size: usize,
    /// |alpha_drift| above this triggers an off-schedule pass.
    pub drift_threshold: f64,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 50,
            similarity_threshold: 0.78,
            min_cluster_size: 3,
            drift_threshold: 0.1,
        }
    }
}

/// Cosine similarity with a zero-norm guard.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Greedy single-pass clustering against each cluster's first member.
pub fn cluster_by_similarity<'a>(
    memories: &'a [MemoryRecord],
    threshold: f32,
) -> Vec<Vec<&'a MemoryRecord>> {
    let mut clusters: Vec<Vec<&MemoryRecord>> = Vec::new();
    for memory in memories {
        let Some(embedding) = memory.embedding.as_deref() else {
            continue;
        };
        let home = clusters.iter_mut().find(|cluster| {
            cluster
                .first()
                .and_then(|seed| seed.embedding.as_deref())
                .map(|seed| cosine_similarity(seed, embedding) >= threshold)
                .unwrap_or(false)
        });
        match home {
            Some(cluster) => cluster.push(memory),
            None => clusters.push(vec![memory]),
        }
    }
    clusters
}

/// Run one synthesis pass; returns how many dreams were stored.
pub async fn synthesize(services: &Arc<Services>, config: &DreamConfig) -> anyhow::Result<usize> {
    let Some(memory) = &services.memory else {
        debug!("no memory service, skipping dream pass");
        return Ok(0);
    };
    let agent_id = services.config.agent_id.clone();
    let recent = memory.recent_memories(&agent_id, config.fetch_limit).await?;
    if recent.is_empty() {
        return Ok(0);
    }

    services.flags.set_dreaming(true);
    let result = synthesize_clusters(services, config, memory, &agent_id, &recent).await;
    services.flags.set_dreaming(false);
    result
}

async fn synthesize_clusters(
    services: &Arc<Services>,
    config: &DreamConfig,
    memory: &Arc<dyn sos_memory::MemoryStore>,
    agent_id: &str,
    recent: &[MemoryRecord],
) -> anyhow::Result<usize> {
    let clusters = cluster_by_similarity(recent, config.similarity_threshold);
    let mut stored = 0;
    for cluster in clusters {
        if cluster.len() < config.min_cluster_size {
            continue;
        }
        let mut prompt = String::from(
            "Synthesize the following related memories into a single insight. \
             Reply with one paragraph that cites their common thread.\n\n",
        );
        for (idx, member) in cluster.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", idx + 1, member.content));
        }
        let request = match ModelRequest::new(prompt) {
            Ok(request) => request.with_max_tokens(512),
            Err(e) => {
                warn!(error = %e, "cluster prompt rejected");
                continue;
            }
        };
        let response = match services.models.generate(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "dream synthesis generation failed");
                continue;
            }
        };
        let references: Vec<String> = cluster.iter().map(|m| m.id.clone()).collect();
        memory
            .store_dream(agent_id, &response.content, &references)
            .await?;
        stored += 1;
        info!(members = references.len(), "dream stored");
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sos_memory::MemoryKind;

    fn memory(id: &str, embedding: Option<Vec<f32>>) -> MemoryRecord {
        MemoryRecord {
            id: id.into(),
            agent_id: "kasra".into(),
            kind: MemoryKind::Exchange,
            content: format!("content of {id}"),
            embedding,
            metadata: serde_json::Value::Null,
            references: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn clustering_groups_similar_and_skips_unembedded() {
        let memories = vec![
            memory("a", Some(vec![1.0, 0.0, 0.0])),
            memory("b", Some(vec![0.99, 0.05, 0.0])),
            memory("c", Some(vec![0.0, 1.0, 0.0])),
            memory("d", Some(vec![0.98, 0.1, 0.0])),
            memory("e", None),
        ];
        let clusters = cluster_by_similarity(&memories, 0.78);
        assert_eq!(clusters.len(), 2);
        let big: Vec<&str> = clusters[0].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(big, vec!["a", "b", "d"]);
        assert_eq!(clusters[1].len(), 1);
    }

    #[test]
    fn orthogonal_memories_never_reach_cluster_size() {
        let memories = vec![
            memory("a", Some(vec![1.0, 0.0, 0.0])),
            memory("b", Some(vec![0.0, 1.0, 0.0])),
            memory("c", Some(vec![0.0, 0.0, 1.0])),
        ];
        let clusters = cluster_by_similarity(&memories, 0.78);
        assert!(clusters.iter().all(|c| c.len() < 3));
    }
}
