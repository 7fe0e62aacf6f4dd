//! Channel axis definitions.
//!
//! A channel is described by an ordered set of axes; its total bin count is
//! the product of the axis lengths. All histograms registered for a channel
//! must share identical axes.

use serde::{Deserialize, Serialize};

/// A single histogram axis: either numeric bin edges or categorical labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    /// Axis name, used for named-axis lookup.
    pub name: String,
    /// Axis binning.
    pub kind: AxisKind,
}

/// Axis binning variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AxisKind {
    /// Numeric binning with explicit edges (`edges.len() - 1` bins).
    Variable {
        /// Monotonically increasing bin edges.
        edges: Vec<f64>,
    },
    /// Categorical binning (one bin per label).
    Category {
        /// Category labels, one bin each.
        labels: Vec<String>,
    },
}

impl Axis {
    /// Numeric axis from explicit bin edges.
    pub fn variable(name: impl Into<String>, edges: Vec<f64>) -> Self {
        Self { name: name.into(), kind: AxisKind::Variable { edges } }
    }

    /// Numeric axis with `n` uniform bins on `[lo, hi]`.
    pub fn regular(name: impl Into<String>, n: usize, lo: f64, hi: f64) -> Self {
        let step = (hi - lo) / n as f64;
        let edges = (0..=n).map(|i| lo + step * i as f64).collect();
        Self::variable(name, edges)
    }

    /// Categorical axis.
    pub fn category(name: impl Into<String>, labels: Vec<String>) -> Self {
        Self { name: name.into(), kind: AxisKind::Category { labels } }
    }

    /// Number of bins on this axis.
    pub fn len(&self) -> usize {
        match &self.kind {
            AxisKind::Variable { edges } => edges.len().saturating_sub(1),
            AxisKind::Category { labels } => labels.len(),
        }
    }

    /// True if the axis has no bins.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Total bin count for an ordered set of axes.
pub fn bin_count(axes: &[Axis]) -> usize {
    axes.iter().map(Axis::len).product()
}

/// Channel metadata persisted alongside the tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel name.
    pub name: String,
    /// Ordered axes defining the channel binning.
    pub axes: Vec<Axis>,
    /// Offset of the channel's first bin in the flattened global bin axis.
    pub bin_offset: usize,
}

impl ChannelInfo {
    /// Total bin count (product of axis lengths).
    pub fn nbins(&self) -> usize {
        bin_count(&self.axes)
    }

    /// Look up an axis by name.
    pub fn axis(&self, name: &str) -> Option<&Axis> {
        self.axes.iter().find(|a| a.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_counts() {
        let eta = Axis::regular("eta", 4, -2.4, 2.4);
        let q = Axis::category("charge", vec!["minus".into(), "plus".into()]);
        assert_eq!(eta.len(), 4);
        assert_eq!(q.len(), 2);
        assert_eq!(bin_count(&[eta, q]), 8);
    }

    #[test]
    fn test_axis_lookup() {
        let info = ChannelInfo {
            name: "ch0".into(),
            axes: vec![Axis::regular("pt", 10, 0.0, 100.0)],
            bin_offset: 0,
        };
        assert_eq!(info.nbins(), 10);
        assert!(info.axis("pt").is_some());
        assert!(info.axis("eta").is_none());
    }

    #[test]
    fn test_axis_equality_detects_mismatch() {
        let a = Axis::regular("pt", 10, 0.0, 100.0);
        let b = Axis::regular("pt", 10, 0.0, 50.0);
        assert_ne!(a, b);
    }
}
