//! Human-in-the-loop theme assignment.
//!
//! Cluster ids carry no meaning of their own. A reviewer looks at the samples from
//! [`summarize`], writes a [`ThemeMap`], and [`annotate`] applies it. Ids the map does
//! not cover get a placeholder theme and are reported back as [`UnmappedCluster`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Write};
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifact;
use crate::cluster::cluster_sizes;
use crate::error::{AppError, AppResult};

/// Placeholder theme for a cluster the reviewer has not named.
pub fn placeholder_theme(cluster_id: usize) -> String {
    format!("Unmapped Theme for Cluster {cluster_id}")
}

/// Reviewer-supplied mapping from cluster id to theme name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct ThemeMap(#[schemars(with = "BTreeMap<String, String>")] BTreeMap<usize, String>);

impl ThemeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the theme for `cluster_id`, replacing any earlier name.
    pub fn insert<S: Into<String>>(&mut self, cluster_id: usize, theme: S) -> AppResult<()> {
        let theme = theme.into().trim().to_string();
        if theme.is_empty() {
            return Err(AppError::InvalidThemeMap(format!(
                "theme name for cluster {cluster_id} is blank"
            )));
        }
        self.0.insert(cluster_id, theme);
        Ok(())
    }

    pub fn get(&self, cluster_id: usize) -> Option<&str> {
        self.0.get(&cluster_id).map(String::as_str)
    }

    /// Theme the reviewer actually chose; an unedited template placeholder does not count.
    fn assigned(&self, cluster_id: usize) -> Option<&str> {
        self.get(cluster_id)
            .filter(|theme| *theme != placeholder_theme(cluster_id))
    }

    pub fn cluster_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.keys().copied()
    }

    /// Template with a placeholder name for each cluster, for the reviewer to edit.
    pub fn template(labels: &[usize]) -> Self {
        Self(
            labels
                .iter()
                .map(|&id| (id, placeholder_theme(id)))
                .collect(),
        )
    }

    /// Parse JSON of the form `{"0": "Usability", "1": "Support"}`.
    pub fn from_json(bytes: &[u8]) -> AppResult<Self> {
        let de = &mut serde_json::Deserializer::from_slice(bytes);
        let raw: BTreeMap<usize, String> = serde_path_to_error::deserialize(de)
            .map_err(|e| AppError::InvalidThemeMap(format!("at {}: {}", e.path(), e.inner())))?;
        let mut map = ThemeMap::new();
        for (id, theme) in raw {
            map.insert(id, theme)?;
        }
        Ok(map)
    }

    /// Load a theme map file.
    pub async fn load(path: &Path) -> AppResult<Self> {
        let bytes = artifact::read_artifact(path).await?;
        Self::from_json(&bytes).map_err(|e| match e {
            AppError::InvalidThemeMap(reason) => {
                AppError::InvalidThemeMap(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }
}

/// Parse a command-line assignment `ID=NAME`.
pub fn parse_assignment(s: &str) -> Result<(usize, String), String> {
    let (id, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=NAME, got '{s}'"))?;
    let id = id
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("cluster id '{}' is not a non-negative integer: {e}", id.trim()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("theme name for cluster {id} is blank"));
    }
    Ok((id, name.to_string()))
}

/// One feedback item with its cluster and theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AnnotatedFeedback {
    pub feedback_text: String,
    pub cluster_id: usize,
    pub theme_label: String,
}

/// Warning: a cluster id with no theme assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmappedCluster {
    pub cluster_id: usize,
    pub items: usize,
    pub placeholder: String,
}

impl Display for UnmappedCluster {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cluster {} ({} items) has no theme; using '{}'",
            self.cluster_id, self.items, self.placeholder
        )
    }
}

/// Result of [`annotate`]: the records plus the non-fatal findings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotation {
    /// One record per input text, in input order.
    pub records: Vec<AnnotatedFeedback>,
    /// Clusters that fell back to a placeholder theme, ascending by id.
    pub unmapped: Vec<UnmappedCluster>,
    /// Mapped ids that never occur in the labels.
    pub unused: Vec<usize>,
}

fn check_lengths(texts: &[String], labels: &[usize]) -> AppResult<()> {
    if texts.len() != labels.len() {
        return Err(AppError::SchemaMismatch(format!(
            "{} feedback strings but {} cluster labels",
            texts.len(),
            labels.len()
        )));
    }
    Ok(())
}

/// Up to `samples_per_cluster` texts per cluster id, in input order.
pub fn summarize<'a>(
    texts: &'a [String],
    labels: &[usize],
    samples_per_cluster: usize,
) -> AppResult<BTreeMap<usize, Vec<&'a str>>> {
    check_lengths(texts, labels)?;
    let mut samples: BTreeMap<usize, Vec<&'a str>> = BTreeMap::new();
    for (text, &label) in texts.iter().zip(labels) {
        let bucket = samples.entry(label).or_default();
        if bucket.len() < samples_per_cluster {
            bucket.push(text.as_str());
        }
    }
    Ok(samples)
}

/// Human-readable listing of the [`summarize`] output.
pub fn render_samples(samples: &BTreeMap<usize, Vec<&str>>, labels: &[usize]) -> String {
    let sizes = cluster_sizes(labels);
    let mut out = String::from("--- Sample Feedback per Cluster (for manual theme mapping) ---\n");
    if samples.is_empty() {
        out.push_str("\nNo clusters to review.\n");
    }
    for (cluster_id, texts) in samples {
        let total = sizes.get(cluster_id).copied().unwrap_or(texts.len());
        let _ = writeln!(out, "\nCluster {cluster_id} ({total} items):");
        for (i, text) in texts.iter().enumerate() {
            let _ = writeln!(out, "  Sample {}: {text}", i + 1);
        }
    }
    out.push_str("\n------------------------------------------------------------\n");
    out
}

/// Apply `theme_map` to every `(text, label)` pair.
///
/// Never fails on a missing mapping: the record gets [`placeholder_theme`] and the
/// cluster is listed in [`Annotation::unmapped`].
#[tracing::instrument(name = "Applying theme map", level = "info", skip_all, fields(n = texts.len()))]
pub fn annotate(texts: &[String], labels: &[usize], theme_map: &ThemeMap) -> AppResult<Annotation> {
    check_lengths(texts, labels)?;

    let sizes = cluster_sizes(labels);
    let unmapped: Vec<UnmappedCluster> = sizes
        .iter()
        .filter(|(id, _)| theme_map.assigned(**id).is_none())
        .map(|(&cluster_id, &items)| UnmappedCluster {
            cluster_id,
            items,
            placeholder: placeholder_theme(cluster_id),
        })
        .collect();
    for u in &unmapped {
        warn!("{u}");
    }

    let present: BTreeSet<usize> = sizes.keys().copied().collect();
    let unused: Vec<usize> = theme_map
        .cluster_ids()
        .filter(|id| !present.contains(id))
        .collect();
    if !unused.is_empty() {
        warn!("Theme map names clusters that do not occur in the labels: {unused:?}");
    }

    let records = texts
        .iter()
        .zip(labels)
        .map(|(text, &cluster_id)| AnnotatedFeedback {
            feedback_text: text.clone(),
            cluster_id,
            theme_label: theme_map
                .assigned(cluster_id)
                .map(str::to_string)
                .unwrap_or_else(|| placeholder_theme(cluster_id)),
        })
        .collect();

    Ok(Annotation {
        records,
        unmapped,
        unused,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn map(entries: &[(usize, &str)]) -> ThemeMap {
        let mut m = ThemeMap::new();
        for (id, name) in entries {
            m.insert(*id, *name).unwrap();
        }
        m
    }

    #[test]
    fn scenario_annotation() {
        let t = texts(&["great UI", "support is slow", "great UI again"]);
        let result = annotate(&t, &[0, 1, 0], &map(&[(0, "Usability"), (1, "Support")])).unwrap();
        assert_eq!(
            result.records,
            vec![
                AnnotatedFeedback {
                    feedback_text: "great UI".into(),
                    cluster_id: 0,
                    theme_label: "Usability".into(),
                },
                AnnotatedFeedback {
                    feedback_text: "support is slow".into(),
                    cluster_id: 1,
                    theme_label: "Support".into(),
                },
                AnnotatedFeedback {
                    feedback_text: "great UI again".into(),
                    cluster_id: 0,
                    theme_label: "Usability".into(),
                },
            ]
        );
        assert!(result.unmapped.is_empty());
        assert!(result.unused.is_empty());
    }

    #[test]
    fn unmapped_cluster_gets_placeholder() {
        let t = texts(&["a", "b", "c"]);
        let result = annotate(&t, &[7, 0, 7], &map(&[(0, "Known")])).unwrap();
        assert_eq!(result.records[0].theme_label, "Unmapped Theme for Cluster 7");
        assert_eq!(result.records[2].theme_label, "Unmapped Theme for Cluster 7");
        assert_eq!(result.records[1].theme_label, "Known");
        assert_eq!(
            result.unmapped,
            vec![UnmappedCluster {
                cluster_id: 7,
                items: 2,
                placeholder: "Unmapped Theme for Cluster 7".into(),
            }]
        );
    }

    #[test]
    fn unedited_template_counts_as_unmapped() {
        let labels = [0, 1, 0];
        let result = annotate(
            &texts(&["a", "b", "c"]),
            &labels,
            &ThemeMap::template(&labels),
        )
        .unwrap();
        let ids: Vec<usize> = result.unmapped.iter().map(|u| u.cluster_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(result.records[1].theme_label, placeholder_theme(1));
        assert!(result.unused.is_empty());
    }

    #[test]
    fn empty_map_maps_everything_to_placeholders() {
        let result = annotate(&texts(&["x"]), &[3], &ThemeMap::new()).unwrap();
        assert_eq!(result.records[0].theme_label, placeholder_theme(3));
    }

    #[test]
    fn stale_entries_are_reported() {
        let result = annotate(&texts(&["x"]), &[0], &map(&[(0, "A"), (5, "B")])).unwrap();
        assert_eq!(result.unused, vec![5]);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let result = annotate(&[], &[], &map(&[(0, "A")])).unwrap();
        assert!(result.records.is_empty());
        assert!(result.unmapped.is_empty());
    }

    #[test]
    fn length_mismatch_is_schema_error() {
        let err = annotate(&texts(&["a", "b"]), &[0], &ThemeMap::new()).unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch(_)));
        assert!(matches!(
            summarize(&texts(&["a"]), &[0, 1], 3),
            Err(AppError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn summarize_caps_samples_and_keeps_order() {
        let t = texts(&["a1", "b1", "a2", "a3", "b2"]);
        let samples = summarize(&t, &[0, 1, 0, 0, 1], 2).unwrap();
        assert_eq!(samples[&0], vec!["a1", "a2"]);
        assert_eq!(samples[&1], vec!["b1", "b2"]);

        let listing = render_samples(&samples, &[0, 1, 0, 0, 1]);
        assert!(listing.contains("Cluster 0 (3 items):\n  Sample 1: a1\n  Sample 2: a2\n"));
        assert!(listing.find("Cluster 0").unwrap() < listing.find("Cluster 1").unwrap());
    }

    #[test]
    fn theme_map_json() {
        let m = ThemeMap::from_json(br#"{"0": "Usability", "3": " Pricing "}"#).unwrap();
        assert_eq!(m.get(0), Some("Usability"));
        assert_eq!(m.get(3), Some("Pricing"));
        assert_eq!(m.get(1), None);

        assert!(matches!(
            ThemeMap::from_json(br#"{"zero": "Usability"}"#),
            Err(AppError::InvalidThemeMap(_))
        ));
        assert!(matches!(
            ThemeMap::from_json(br#"{"0": "  "}"#),
            Err(AppError::InvalidThemeMap(_))
        ));
    }

    #[test]
    fn assignments_parse_and_override() {
        assert_eq!(parse_assignment("2=Support"), Ok((2, "Support".to_string())));
        assert_eq!(
            parse_assignment(" 4 = New Feature Suggestions "),
            Ok((4, "New Feature Suggestions".to_string()))
        );
        assert!(parse_assignment("Support").is_err());
        assert!(parse_assignment("-1=Support").is_err());
        assert!(parse_assignment("1=").is_err());

        let mut base = map(&[(0, "Old"), (1, "Keep")]);
        base.insert(0, "New").unwrap();
        assert_eq!(base.get(0), Some("New"));
        assert_eq!(base.get(1), Some("Keep"));
    }

    #[test]
    fn template_lists_each_cluster_once() {
        let t = ThemeMap::template(&[1, 0, 1]);
        assert_eq!(t.cluster_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(t.get(1), Some("Unmapped Theme for Cluster 1"));
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(
            json,
            r#"{"0":"Unmapped Theme for Cluster 0","1":"Unmapped Theme for Cluster 1"}"#
        );
    }
}
