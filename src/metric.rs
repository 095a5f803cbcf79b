//! The metric value model.
//!
//! A `Metric` is the atomic unit of telemetry in stafford: a named reading
//! that is either a `gauge` -- an absolute value, last write wins -- or a
//! `counter` -- an integer delta, writes accumulate. The same structure is
//! used on the wire, in the stores and in the backup file.

use std::fmt;

/// The two aggregation rules stafford understands.
///
/// The wire carries the kind as a free-form string so that an unknown kind
/// can be rejected by validation rather than failing JSON decode. This enum
/// is the validated form.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MetricKind {
    /// Absolute reading. Each update replaces the previous value.
    Gauge,
    /// Integer delta. Each update adds to the previously stored delta.
    Counter,
}

impl MetricKind {
    /// Parse a wire kind name. Case-sensitive, exactly `gauge` or `counter`.
    pub fn from_name(name: &str) -> Option<MetricKind> {
        match name {
            "gauge" => Some(MetricKind::Gauge),
            "counter" => Some(MetricKind::Counter),
            _ => None,
        }
    }

    /// The wire name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// True if `kind` names a supported metric kind.
pub fn supported(kind: &str) -> bool {
    MetricKind::from_name(kind).is_some()
}

/// A single named measurement.
///
/// Exactly one of `value` / `delta` is set, according to `kind`. `hash` is a
/// keyed signature over the canonical encoding and is only present when both
/// ends share a signing key.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// The unique name of the measurement.
    pub id: String,
    /// Wire kind, `gauge` or `counter`. Anything else fails validation.
    #[serde(rename = "type")]
    pub kind: String,
    /// The reading, set for gauges only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// The delta, set for counters only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    /// Hex-encoded keyed signature of the canonical encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Metric {
    /// Create a gauge metric.
    pub fn gauge<S>(id: S, value: f64) -> Metric
    where
        S: Into<String>,
    {
        Metric {
            id: id.into(),
            kind: MetricKind::Gauge.name().to_string(),
            value: Some(value),
            delta: None,
            hash: None,
        }
    }

    /// Create a counter metric.
    pub fn counter<S>(id: S, delta: i64) -> Metric
    where
        S: Into<String>,
    {
        Metric {
            id: id.into(),
            kind: MetricKind::Counter.name().to_string(),
            value: None,
            delta: Some(delta),
            hash: None,
        }
    }

    /// The validated kind of this metric, `None` when unsupported.
    pub fn metric_kind(&self) -> Option<MetricKind> {
        MetricKind::from_name(&self.kind)
    }

    /// The exact byte string fed to the keyed signature.
    ///
    /// Gauges print their value with six fixed decimal places, counters print
    /// their delta as a plain integer:
    ///
    ///   `<id>:gauge:0.000000` | `<id>:counter:0`
    ///
    /// Returns `None` when the kind is unsupported or the field matching the
    /// kind is absent.
    pub fn canonical(&self) -> Option<String> {
        match self.metric_kind()? {
            MetricKind::Gauge => {
                self.value.map(|v| format!("{}:gauge:{:.6}", self.id, v))
            }
            MetricKind::Counter => {
                self.delta.map(|d| format!("{}:counter:{}", self.id, d))
            }
        }
    }

    /// The reading widened to a float, counters converted value-for-value.
    ///
    /// This is the view the backup readers and dashboards consume; the stores
    /// themselves never widen.
    pub fn float_value(&self) -> Option<f64> {
        match self.metric_kind()? {
            MetricKind::Gauge => self.value,
            MetricKind::Counter => self.delta.map(|d| d as f64),
        }
    }
}

// Tests
//
#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    impl Arbitrary for Metric {
        fn arbitrary<G: Gen>(g: &mut G) -> Metric {
            let id: String = Arbitrary::arbitrary(g);
            if g.gen() {
                Metric::gauge(id, g.gen_range(-1.0e6, 1.0e6))
            } else {
                Metric::counter(id, g.gen_range(-1_000_000, 1_000_000))
            }
        }
    }

    #[test]
    fn test_kind_names_round_trip() {
        assert_eq!(MetricKind::from_name("gauge"), Some(MetricKind::Gauge));
        assert_eq!(MetricKind::from_name("counter"), Some(MetricKind::Counter));
        assert_eq!(MetricKind::from_name("Gauge"), None);
        assert_eq!(MetricKind::from_name("histogram"), None);
        assert_eq!(MetricKind::from_name(""), None);

        assert!(supported("gauge"));
        assert!(supported("counter"));
        assert!(!supported("timer"));
    }

    #[test]
    fn test_canonical_encoding() {
        let g = Metric::gauge("TestGauge", 15.0);
        assert_eq!(g.canonical().unwrap(), "TestGauge:gauge:15.000000");

        let c = Metric::counter("TestCounter", 15);
        assert_eq!(c.canonical().unwrap(), "TestCounter:counter:15");

        let unknown = Metric {
            id: "x".to_string(),
            kind: "histogram".to_string(),
            value: Some(1.0),
            delta: None,
            hash: None,
        };
        assert_eq!(unknown.canonical(), None);
    }

    #[test]
    fn test_wire_shape() {
        let c = Metric::counter("hits", 10);
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"id":"hits","type":"counter","delta":10}"#);

        let g: Metric =
            serde_json::from_str(r#"{"id":"cpu","type":"gauge","value":0.5}"#)
                .unwrap();
        assert_eq!(g, Metric::gauge("cpu", 0.5));

        // unknown kinds decode fine; validation happens later
        let odd: Metric =
            serde_json::from_str(r#"{"id":"x","type":"wat","value":1.0}"#).unwrap();
        assert_eq!(odd.metric_kind(), None);
    }

    #[test]
    fn test_exactly_one_side_set() {
        fn inner(m: Metric) -> TestResult {
            match m.metric_kind().unwrap() {
                MetricKind::Gauge => {
                    assert!(m.value.is_some() && m.delta.is_none())
                }
                MetricKind::Counter => {
                    assert!(m.delta.is_some() && m.value.is_none())
                }
            }
            assert!(m.canonical().is_some());
            assert!(m.float_value().is_some());
            TestResult::passed()
        }
        QuickCheck::new().quickcheck(inner as fn(Metric) -> TestResult);
    }
}
