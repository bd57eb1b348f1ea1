//! Contracts the engine requires from the time-series database it reads samples from.
//!
//! The TSDB itself (chart/dimension registry, storage engine) is an external
//! collaborator and out of scope; this module only fixes the shape of what the engine
//! needs to pull from it, plus an in-crate mock used by the rest of the test suite.

/// A single stored sample: a timestamp (unix seconds) and a raw collected value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: f64,
}

/// How a dimension's collected values relate to what gets exported, mirroring
/// netdata's `RRD_ALGORITHM`. Determines Prometheus counter-vs-gauge typing (§4.6) and
/// whether a chart's dimensions are homogeneous enough to share one metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Absolute,
    Incremental,
    PcentOverDiffTotal,
    PcentOverRowTotal,
}

/// A dimension (one exported time series) within a chart.
pub trait TsdbDim {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    /// Points stored in `[after, before]`, oldest first.
    fn points_in_range(&self, after: i64, before: i64) -> Vec<Point>;
    /// The oldest and latest timestamps this dimension has any stored data for, or
    /// `None` if it holds no points at all. Used to clamp the §4.1 reduction window.
    fn oldest_and_latest(&self) -> Option<(i64, i64)>;
    fn algorithm(&self) -> Algorithm;
    fn multiplier(&self) -> i64;
    fn divisor(&self) -> i64;
}

/// A chart (a collection of dimensions sharing an update interval).
pub trait TsdbChart {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn context(&self) -> &str;
    fn family(&self) -> &str;
    fn units(&self) -> &str;
    fn update_every(&self) -> i64;
    fn dims(&self) -> Vec<&dyn TsdbDim>;
}

/// A host (an agent instance, possibly a parent collecting from children).
pub trait TsdbHost {
    fn hostname(&self) -> &str;
    fn charts(&self) -> Vec<&dyn TsdbChart>;
    /// Configured + automatic labels attached to this host.
    fn labels(&self) -> Vec<(String, String, LabelSource)>;
    /// Custom dashboard variables (`RRDVAR`s) independent of any chart, emitted as
    /// their own gauges when an instance has `send_variables` enabled. Most hosts have
    /// none; defaults to empty.
    fn variables(&self) -> Vec<(String, f64)> {
        Vec::new()
    }
}

/// Where a host label came from, mirroring `RRDLABEL_SRC_CONFIG` / `RRDLABEL_SRC_AUTO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    Configured,
    Automatic,
}

/// Write contract needed to publish the engine's own self-telemetry (§4.8) back into
/// the TSDB, under the `netdata` host's `exporting` family. Mirrors the
/// `rrdset_create`/`rrddim_set_by_pointer`/`rrdset_done` calls in
/// `generate_charts_stats`, split into ensure/set/commit so the engine need not know
/// the TSDB's own chart-creation API.
pub trait TelemetrySink: Send + Sync {
    /// Creates the chart with `dimension_ids` on first call; a no-op afterward.
    fn ensure_chart(&self, chart_id: &str, dimension_ids: &[&str]);
    /// Sets one dimension's pending value for the next commit.
    fn set_dimension(&self, chart_id: &str, dimension_id: &str, value: i64);
    /// Commits every dimension set since the last commit as one sample.
    fn commit_chart(&self, chart_id: &str);
}

/// A minimal in-memory TSDB used by the rest of the crate's tests.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    pub struct MockDim {
        pub id: String,
        pub points: Vec<Point>,
        pub algorithm: Algorithm,
        pub multiplier: i64,
        pub divisor: i64,
    }

    impl MockDim {
        /// A plain absolute-algorithm dimension with unit multiplier/divisor, the
        /// common case in tests that don't care about homogeneity/typing.
        pub fn new(id: impl Into<String>, points: Vec<Point>) -> Self {
            Self { id: id.into(), points, algorithm: Algorithm::Absolute, multiplier: 1, divisor: 1 }
        }

        pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
            self.algorithm = algorithm;
            self
        }

        pub fn with_multiplier(mut self, multiplier: i64) -> Self {
            self.multiplier = multiplier;
            self
        }
    }

    impl TsdbDim for MockDim {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn points_in_range(&self, after: i64, before: i64) -> Vec<Point> {
            self.points.iter().copied().filter(|p| p.timestamp >= after && p.timestamp <= before).collect()
        }
        fn oldest_and_latest(&self) -> Option<(i64, i64)> {
            let oldest = self.points.first()?.timestamp;
            let latest = self.points.last()?.timestamp;
            Some((oldest, latest))
        }
        fn algorithm(&self) -> Algorithm {
            self.algorithm
        }
        fn multiplier(&self) -> i64 {
            self.multiplier
        }
        fn divisor(&self) -> i64 {
            self.divisor
        }
    }

    pub struct MockChart {
        pub id: String,
        pub context: String,
        pub family: String,
        pub units: String,
        pub update_every: i64,
        pub dims: Vec<MockDim>,
    }

    impl TsdbChart for MockChart {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            &self.id
        }
        fn context(&self) -> &str {
            &self.context
        }
        fn family(&self) -> &str {
            &self.family
        }
        fn units(&self) -> &str {
            &self.units
        }
        fn update_every(&self) -> i64 {
            self.update_every
        }
        fn dims(&self) -> Vec<&dyn TsdbDim> {
            self.dims.iter().map(|d| d as &dyn TsdbDim).collect()
        }
    }

    pub struct MockHost {
        pub hostname: String,
        pub charts: Vec<MockChart>,
        pub labels: Vec<(String, String, LabelSource)>,
    }

    impl TsdbHost for MockHost {
        fn hostname(&self) -> &str {
            &self.hostname
        }
        fn charts(&self) -> Vec<&dyn TsdbChart> {
            self.charts.iter().map(|c| c as &dyn TsdbChart).collect()
        }
        fn labels(&self) -> Vec<(String, String, LabelSource)> {
            self.labels.clone()
        }
    }

    /// Records every chart/dimension/value the engine pushes through it, for
    /// asserting self-telemetry publishing in tests.
    #[derive(Default)]
    pub struct MockTelemetrySink {
        pub charts: Mutex<std::collections::HashMap<String, Vec<String>>>,
        pub values: Mutex<std::collections::HashMap<(String, String), i64>>,
        pub commits: Mutex<Vec<String>>,
    }

    impl MockTelemetrySink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl TelemetrySink for MockTelemetrySink {
        fn ensure_chart(&self, chart_id: &str, dimension_ids: &[&str]) {
            self.charts
                .lock()
                .entry(chart_id.to_string())
                .or_insert_with(|| dimension_ids.iter().map(|s| s.to_string()).collect());
        }
        fn set_dimension(&self, chart_id: &str, dimension_id: &str, value: i64) {
            self.values.lock().insert((chart_id.to_string(), dimension_id.to_string()), value);
        }
        fn commit_chart(&self, chart_id: &str) {
            self.commits.lock().push(chart_id.to_string());
        }
    }
}
