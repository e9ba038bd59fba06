//! Cross-agent matching and consensus classification.
//!
//! Matching is greedy and order-dependent: agents are compared pairwise in the
//! order given, and a finding joins at most one group (first match wins). A
//! finding attaches to an existing group when it is similar to the one member it
//! was compared against; it is not re-checked against the other members.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::finding::{Category, Finding, Severity};
use crate::core::similarity::similarity;

/// All findings one agent contributed to a review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFindings {
    pub agent: String,
    pub findings: Vec<Finding>,
}

/// A group of matched findings collapsed into one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedFinding {
    pub id: String,
    pub category: Category,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub sources: Vec<String>,
    pub descriptions: BTreeMap<String, String>,
    pub suggestions: Vec<String>,
}

/// Findings split into agreement tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub participants: Vec<String>,
    pub total_findings: usize,
    /// Every participant agreed (only possible with three or more participants).
    pub consensus: Vec<MergedFinding>,
    /// At least two participants agreed.
    pub majority: Vec<MergedFinding>,
    /// Unmatched findings, by originating agent.
    pub unique: BTreeMap<String, Vec<Finding>>,
    pub by_category: BTreeMap<Category, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

/// (agent index, finding index) into the aggregation input.
type FindingKey = (usize, usize);

#[derive(Debug, Default)]
struct Group {
    members: Vec<FindingKey>,
    agents: BTreeSet<usize>,
}

impl Group {
    fn add(&mut self, key: FindingKey) {
        self.members.push(key);
        self.agents.insert(key.0);
    }
}

/// Group similar findings across agents and classify each group.
pub fn aggregate(agents: &[AgentFindings], threshold: f64) -> Aggregation {
    let groups = match_groups(agents, threshold);
    let grouped: BTreeSet<FindingKey> = groups
        .iter()
        .flat_map(|g| g.members.iter().copied())
        .collect();

    let participants = agents.len();
    let mut consensus = Vec::new();
    let mut majority = Vec::new();
    for group in &groups {
        let merged = merge(agents, group);
        if group.agents.len() >= participants && participants >= 3 {
            consensus.push(merged);
        } else if group.agents.len() >= 2 {
            majority.push(merged);
        }
    }
    consensus.sort_by(|a, b| b.severity.cmp(&a.severity));
    majority.sort_by(|a, b| b.severity.cmp(&a.severity));

    let mut unique: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
    for (ai, agent) in agents.iter().enumerate() {
        for (fi, finding) in agent.findings.iter().enumerate() {
            if !grouped.contains(&(ai, fi)) {
                unique
                    .entry(agent.agent.clone())
                    .or_default()
                    .push(finding.clone());
            }
        }
    }

    let mut by_category = BTreeMap::new();
    let mut by_severity = BTreeMap::new();
    for merged in consensus.iter().chain(&majority) {
        *by_category.entry(merged.category).or_insert(0) += 1;
        *by_severity.entry(merged.severity).or_insert(0) += 1;
    }

    Aggregation {
        participants: agents.iter().map(|a| a.agent.clone()).collect(),
        total_findings: agents.iter().map(|a| a.findings.len()).sum(),
        consensus,
        majority,
        unique,
        by_category,
        by_severity,
    }
}

fn match_groups(agents: &[AgentFindings], threshold: f64) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut group_of: HashMap<FindingKey, usize> = HashMap::new();

    for i in 0..agents.len() {
        for j in (i + 1)..agents.len() {
            for (fi, f1) in agents[i].findings.iter().enumerate() {
                for (fj, f2) in agents[j].findings.iter().enumerate() {
                    let (k1, k2) = ((i, fi), (j, fj));
                    let target = match (group_of.get(&k1), group_of.get(&k2)) {
                        (Some(_), Some(_)) => continue,
                        (Some(&g), None) if groups[g].agents.contains(&j) => continue,
                        (None, Some(&g)) if groups[g].agents.contains(&i) => continue,
                        (Some(&g), None) | (None, Some(&g)) => Some(g),
                        (None, None) => None,
                    };
                    if similarity(f1, f2) < threshold {
                        continue;
                    }
                    let g = target.unwrap_or_else(|| {
                        groups.push(Group::default());
                        groups.len() - 1
                    });
                    for key in [k1, k2] {
                        if !group_of.contains_key(&key) {
                            groups[g].add(key);
                            group_of.insert(key, g);
                        }
                    }
                }
            }
        }
    }
    groups
}

fn merge(agents: &[AgentFindings], group: &Group) -> MergedFinding {
    let members: Vec<&Finding> = group
        .members
        .iter()
        .map(|&(ai, fi)| &agents[ai].findings[fi])
        .collect();
    let first = members[0];
    let sources: BTreeSet<String> = group
        .agents
        .iter()
        .map(|&ai| agents[ai].agent.clone())
        .collect();
    MergedFinding {
        id: first.id.clone(),
        category: first.category,
        severity: members
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(first.severity),
        file: first.file.clone(),
        line: first.line,
        sources: sources.into_iter().collect(),
        descriptions: group
            .members
            .iter()
            .map(|&(ai, fi)| {
                (
                    agents[ai].agent.clone(),
                    agents[ai].findings[fi].description.clone(),
                )
            })
            .collect(),
        suggestions: members
            .iter()
            .filter_map(|f| f.suggestion.clone())
            .filter(|s| !s.trim().is_empty())
            .collect(),
    }
}
