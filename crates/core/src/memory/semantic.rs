//! Semantic memory: append-only JSON Lines store of recorded nodes.
//!
//! One node per line. Appends write a whole line with a single `write_all`;
//! a torn trailing line left by a crash is skipped on read, whatever bytes
//! it ends in. Retention compaction rewrites the file with
//! write-to-temp-then-rename once the store overshoots its bound.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use driftguard_embed::Embedder;

use crate::error::{GuardError, GuardResult};
use crate::persist;
use crate::tension::{Thresholds, cosine_similarity, midpoint};
use crate::types::{ReasoningDirection, SemanticNode, Zone};

/// A candidate must resemble the midpoint more than this fraction of its
/// resemblance to either endpoint to count as "between" them.
const BRIDGE_BETWEENNESS: f32 = 0.8;

#[derive(Debug, Clone)]
pub struct SemanticMemory {
    path: PathBuf,
    max_nodes: usize,
}

/// Node count per zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZoneSummary {
    pub safe: usize,
    pub transitional: usize,
    pub risk: usize,
    pub danger: usize,
}

impl ZoneSummary {
    pub fn add(&mut self, zone: Zone) {
        match zone {
            Zone::Safe => self.safe += 1,
            Zone::Transitional => self.transitional += 1,
            Zone::Risk => self.risk += 1,
            Zone::Danger => self.danger += 1,
        }
    }

    pub fn get(&self, zone: Zone) -> usize {
        match zone {
            Zone::Safe => self.safe,
            Zone::Transitional => self.transitional,
            Zone::Risk => self.risk,
            Zone::Danger => self.danger,
        }
    }
}

impl FromIterator<Zone> for ZoneSummary {
    fn from_iter<I: IntoIterator<Item = Zone>>(iter: I) -> Self {
        let mut summary = Self::default();
        for zone in iter {
            summary.add(zone);
        }
        summary
    }
}

/// An exported node with its zone resolved.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    #[serde(flatten)]
    pub node: SemanticNode,
    pub zone: Zone,
}

/// JSON-serializable snapshot of recorded nodes.
#[derive(Debug, Clone, Serialize)]
pub struct TreeExport {
    pub version: &'static str,
    pub exported_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub node_count: usize,
    /// Chronological.
    pub nodes: Vec<TreeNode>,
    pub zone_summary: ZoneSummary,
}

impl SemanticMemory {
    pub fn open(path: impl Into<PathBuf>, max_nodes: usize) -> Self {
        Self {
            path: path.into(),
            max_nodes: max_nodes.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a node as one line.
    pub fn append(&self, node: &SemanticNode) -> GuardResult<()> {
        let mut line = serde_json::to_vec(node)?;
        line.push(b'\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GuardError::io(&self.path, e))?;
        if ends_mid_line(&mut file).map_err(|e| GuardError::io(&self.path, e))? {
            line.insert(0, b'\n');
        }
        file.write_all(&line)
            .map_err(|e| GuardError::io(&self.path, e))?;
        file.sync_data().map_err(|e| GuardError::io(&self.path, e))?;
        Ok(())
    }

    /// Every readable node, oldest first.
    fn load_all(&self) -> GuardResult<Vec<SemanticNode>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(GuardError::io(&self.path, e)),
        };

        // Raw bytes: a record torn inside a multi-byte character is just
        // another undecodable line.
        let mut nodes = Vec::new();
        for (lineno, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line.map_err(|e| GuardError::io(&self.path, e))?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice::<SemanticNode>(&line) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    tracing::debug!(line = lineno + 1, error = %e, "skipping unreadable memory record");
                }
            }
        }
        Ok(nodes)
    }

    /// Physical line count, torn records included. Cheaper than parsing.
    fn line_count(&self) -> GuardResult<usize> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(GuardError::io(&self.path, e)),
        };
        let mut reader = BufReader::new(file);
        let mut count = 0;
        loop {
            let buf = reader.fill_buf().map_err(|e| GuardError::io(&self.path, e))?;
            if buf.is_empty() {
                return Ok(count);
            }
            count += buf.iter().filter(|&&b| b == b'\n').count();
            let len = buf.len();
            reader.consume(len);
        }
    }

    /// Number of readable nodes.
    pub fn count(&self) -> GuardResult<usize> {
        Ok(self.load_all()?.len())
    }

    /// Up to `n` most recent nodes, newest first, optionally scoped to a
    /// session. Embeddings are dropped unless `include_embeddings`.
    ///
    /// Callers that aggregate the result must not depend on its order.
    pub fn get_recent(
        &self,
        n: usize,
        session_id: Option<&str>,
        include_embeddings: bool,
    ) -> GuardResult<Vec<SemanticNode>> {
        let nodes = self.load_all()?;
        Ok(nodes
            .into_iter()
            .rev()
            .filter(|node| session_id.is_none_or(|s| node.session_id == s))
            .take(n)
            .map(|mut node| {
                if !include_embeddings {
                    node.embedding = None;
                }
                node
            })
            .collect())
    }

    /// All nodes of one session, oldest first.
    pub fn session_nodes(&self, session_id: &str) -> GuardResult<Vec<SemanticNode>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|n| n.session_id == session_id)
            .collect())
    }

    /// Up to `limit` nodes whose ΔS falls in `zone`, newest first, without
    /// embeddings.
    pub fn get_by_zone(
        &self,
        zone: Zone,
        thresholds: &Thresholds,
        limit: usize,
    ) -> GuardResult<Vec<SemanticNode>> {
        Ok(self
            .load_all()?
            .into_iter()
            .rev()
            .filter(|n| n.zone(thresholds) == zone)
            .take(limit)
            .map(|mut n| {
                n.embedding = None;
                n
            })
            .collect())
    }

    /// Id of the session's latest convergent node: the parent of the next
    /// recorded step.
    pub fn last_convergent(&self, session_id: &str) -> GuardResult<Option<Uuid>> {
        Ok(self
            .load_all()?
            .into_iter()
            .rev()
            .find(|n| {
                n.session_id == session_id && n.lambda_observe == ReasoningDirection::Convergent
            })
            .map(|n| n.id))
    }

    /// Nodes whose embedding has cosine similarity >= `min_similarity` to
    /// `query`, most similar first, at most `top_k`.
    pub fn find_similar(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: f32,
    ) -> GuardResult<Vec<(SemanticNode, f32)>> {
        let mut scored: Vec<(SemanticNode, f32)> = self
            .load_all()?
            .into_iter()
            .filter_map(|node| {
                let sim = cosine_similarity(query, node.embedding.as_deref()?);
                (sim >= min_similarity).then_some((node, sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Recorded topics that sit semantically between `current_topic` and
    /// `target_topic`: nearest neighbours of the midpoint of their
    /// embeddings. Empty when memory is empty or embedding fails.
    pub async fn find_bridge(
        &self,
        embedder: &dyn Embedder,
        current_topic: &str,
        target_topic: &str,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<SemanticNode> {
        if top_k == 0 {
            return Vec::new();
        }
        let current = match embedder.embed(current_topic).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "bridge search: current topic embedding failed");
                return Vec::new();
            }
        };
        let target = match embedder.embed(target_topic).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "bridge search: target topic embedding failed");
                return Vec::new();
            }
        };
        let Some(mid) = midpoint(&current, &target) else {
            tracing::warn!("bridge search: topic embeddings differ in dimension");
            return Vec::new();
        };

        let candidates = match self.find_similar(&mid, top_k * 2, min_similarity) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "bridge search: memory read failed");
                return Vec::new();
            }
        };

        candidates
            .into_iter()
            .filter_map(|(node, sim_to_mid)| {
                let emb = node.embedding.as_deref()?;
                let nearest_end = cosine_similarity(emb, &current).max(cosine_similarity(emb, &target));
                (sim_to_mid > nearest_end * BRIDGE_BETWEENNESS).then_some(node)
            })
            .take(top_k)
            .collect()
    }

    /// Store size that triggers a compaction. Between compactions appends
    /// never rewrite the file.
    pub fn high_water_mark(&self) -> usize {
        self.max_nodes + (self.max_nodes / 10).max(1)
    }

    /// Once the store grows past [`Self::high_water_mark`], drop the oldest
    /// nodes down to `max_nodes`. Returns how many were removed.
    pub fn enforce_retention(&self) -> GuardResult<usize> {
        if self.line_count()? <= self.high_water_mark() {
            return Ok(0);
        }
        let nodes = self.load_all()?;
        if nodes.len() <= self.max_nodes {
            return Ok(0);
        }
        let removed = nodes.len() - self.max_nodes;
        let mut buf = Vec::new();
        for node in &nodes[removed..] {
            serde_json::to_writer(&mut buf, node)?;
            buf.push(b'\n');
        }
        persist::write_atomic(&self.path, &buf)?;
        tracing::info!(removed, kept = self.max_nodes, "semantic memory compacted");
        Ok(removed)
    }

    /// Snapshot for export: one session in full, or the latest `limit` nodes.
    /// Zones are resolved against `thresholds`.
    pub fn export_tree(
        &self,
        session_id: Option<&str>,
        limit: usize,
        thresholds: &Thresholds,
    ) -> GuardResult<TreeExport> {
        let nodes = match session_id {
            Some(s) => self.session_nodes(s)?,
            None => {
                let mut recent = self.get_recent(limit, None, false)?;
                recent.reverse();
                recent
            }
        };
        let nodes: Vec<TreeNode> = nodes
            .into_iter()
            .map(|mut node| {
                node.embedding = None;
                let zone = node.zone(thresholds);
                TreeNode { node, zone }
            })
            .collect();
        Ok(TreeExport {
            version: "1.0",
            exported_at: Utc::now(),
            session_id: session_id.map(str::to_owned),
            node_count: nodes.len(),
            zone_summary: nodes.iter().map(|n| n.zone).collect(),
            nodes,
        })
    }
}

/// True when a previous writer died mid-record, so the next record must
/// start on a fresh line.
fn ends_mid_line(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0_u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
