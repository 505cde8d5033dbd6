//! Per-service annotation decoding.
//!
//! Services opt into mesh behavior through annotations. Two prefixes are
//! recognized: the current `mesh.trellis.io/` and the legacy `trellis.io/`;
//! the current prefix wins when both carry the same key. A missing optional
//! key is a distinguished `NotFound`, separate from a malformed value.

use std::collections::BTreeMap;
use trellis_controller_core::config::{CircuitBreaker, HttpMiddleware, RateLimit, Retry};
use trellis_controller_core::{Scheme, TrafficType};

pub const CURRENT_PREFIX: &str = "mesh.trellis.io";
pub const LEGACY_PREFIX: &str = "trellis.io";

pub const TRAFFIC_TYPE: &str = "traffic-type";
pub const SCHEME: &str = "scheme";
pub const RETRY_ATTEMPTS: &str = "retry-attempts";
pub const CIRCUIT_BREAKER_EXPRESSION: &str = "circuit-breaker-expression";
pub const RATELIMIT_AVERAGE: &str = "ratelimit-average";
pub const RATELIMIT_BURST: &str = "ratelimit-burst";

pub type Annotations = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    #[error("annotation not found")]
    NotFound,

    #[error("invalid value {value:?} for annotation {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl AnnotationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    fn invalid(suffix: &str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key: format!("{CURRENT_PREFIX}/{suffix}"),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn get<'a>(annotations: &'a Annotations, suffix: &str) -> Option<&'a str> {
    annotations
        .get(&format!("{CURRENT_PREFIX}/{suffix}"))
        .or_else(|| annotations.get(&format!("{LEGACY_PREFIX}/{suffix}")))
        .map(String::as_str)
}

/// Writes the traffic-type annotation, current prefix.
pub fn set_traffic_type(annotations: &mut Annotations, ty: TrafficType) {
    annotations.insert(format!("{CURRENT_PREFIX}/{TRAFFIC_TYPE}"), ty.to_string());
}

pub fn traffic_type(annotations: &Annotations) -> Result<TrafficType, AnnotationError> {
    let value = get(annotations, TRAFFIC_TYPE).ok_or(AnnotationError::NotFound)?;
    value
        .parse()
        .map_err(|error| AnnotationError::invalid(TRAFFIC_TYPE, value, error))
}

pub fn scheme(annotations: &Annotations) -> Result<Scheme, AnnotationError> {
    let value = get(annotations, SCHEME).ok_or(AnnotationError::NotFound)?;
    value
        .parse()
        .map_err(|error| AnnotationError::invalid(SCHEME, value, error))
}

fn positive_int<T>(annotations: &Annotations, suffix: &str) -> Result<T, AnnotationError>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = get(annotations, suffix).ok_or(AnnotationError::NotFound)?;
    let parsed: T = value
        .parse()
        .map_err(|error| AnnotationError::invalid(suffix, value, error))?;
    if parsed <= T::default() {
        return Err(AnnotationError::invalid(suffix, value, "must be positive"));
    }
    Ok(parsed)
}

pub fn retry_attempts(annotations: &Annotations) -> Result<u32, AnnotationError> {
    positive_int(annotations, RETRY_ATTEMPTS)
}

pub fn circuit_breaker_expression(annotations: &Annotations) -> Result<String, AnnotationError> {
    let value = get(annotations, CIRCUIT_BREAKER_EXPRESSION).ok_or(AnnotationError::NotFound)?;
    if value.is_empty() {
        return Err(AnnotationError::invalid(
            CIRCUIT_BREAKER_EXPRESSION,
            value,
            "must not be empty",
        ));
    }
    Ok(value.to_string())
}

/// Reads the rate-limit pair; both keys are required together.
pub fn rate_limit(annotations: &Annotations) -> Result<RateLimit, AnnotationError> {
    let average = positive_int(annotations, RATELIMIT_AVERAGE);
    let burst = positive_int(annotations, RATELIMIT_BURST);
    match (average, burst) {
        (Ok(average), Ok(burst)) => Ok(RateLimit { average, burst }),
        // Malformed values surface before the pairing rule.
        (Err(e), _) | (_, Err(e)) if !e.is_not_found() => Err(e),
        (Err(_), Err(_)) => Err(AnnotationError::NotFound),
        (Err(_), Ok(_)) => Err(AnnotationError::invalid(
            RATELIMIT_AVERAGE,
            "",
            "required together with ratelimit-burst",
        )),
        (Ok(_), Err(_)) => Err(AnnotationError::invalid(
            RATELIMIT_BURST,
            "",
            "required together with ratelimit-average",
        )),
    }
}

/// Assembles the middleware bundle a service's annotations describe.
///
/// Absent options are simply left out of the bundle; malformed values
/// surface as errors.
pub fn middlewares(annotations: &Annotations) -> Result<HttpMiddleware, AnnotationError> {
    let mut bundle = HttpMiddleware::default();

    match retry_attempts(annotations) {
        Ok(attempts) => bundle.retry = Some(Retry { attempts }),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    match circuit_breaker_expression(annotations) {
        Ok(expression) => bundle.circuit_breaker = Some(CircuitBreaker { expression }),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    match rate_limit(annotations) {
        Ok(rate_limit) => bundle.rate_limit = Some(rate_limit),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anns(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn traffic_type_distinguishes_missing_from_malformed() {
        assert_eq!(traffic_type(&anns(&[])), Err(AnnotationError::NotFound));
        assert_eq!(
            traffic_type(&anns(&[("mesh.trellis.io/traffic-type", "tcp")])),
            Ok(TrafficType::Tcp)
        );
        assert!(matches!(
            traffic_type(&anns(&[("mesh.trellis.io/traffic-type", "grpc")])),
            Err(AnnotationError::Invalid { .. })
        ));
    }

    #[test]
    fn current_prefix_wins_over_legacy() {
        let annotations = anns(&[
            ("trellis.io/traffic-type", "udp"),
            ("mesh.trellis.io/traffic-type", "tcp"),
        ]);
        assert_eq!(traffic_type(&annotations), Ok(TrafficType::Tcp));

        let legacy_only = anns(&[("trellis.io/traffic-type", "udp")]);
        assert_eq!(traffic_type(&legacy_only), Ok(TrafficType::Udp));
    }

    #[test]
    fn retry_attempts_must_be_positive() {
        assert_eq!(
            retry_attempts(&anns(&[("mesh.trellis.io/retry-attempts", "3")])),
            Ok(3)
        );
        assert!(matches!(
            retry_attempts(&anns(&[("mesh.trellis.io/retry-attempts", "0")])),
            Err(AnnotationError::Invalid { .. })
        ));
        assert!(matches!(
            retry_attempts(&anns(&[("mesh.trellis.io/retry-attempts", "many")])),
            Err(AnnotationError::Invalid { .. })
        ));
    }

    #[test]
    fn rate_limit_requires_both_keys() {
        assert_eq!(rate_limit(&anns(&[])), Err(AnnotationError::NotFound));
        assert_eq!(
            rate_limit(&anns(&[
                ("mesh.trellis.io/ratelimit-average", "100"),
                ("mesh.trellis.io/ratelimit-burst", "200"),
            ])),
            Ok(RateLimit {
                average: 100,
                burst: 200
            })
        );
        assert!(matches!(
            rate_limit(&anns(&[("mesh.trellis.io/ratelimit-average", "100")])),
            Err(AnnotationError::Invalid { .. })
        ));
    }

    #[test]
    fn middleware_bundle_collects_options() {
        let annotations = anns(&[
            ("mesh.trellis.io/retry-attempts", "2"),
            (
                "mesh.trellis.io/circuit-breaker-expression",
                "NetworkErrorRatio() > 0.5",
            ),
        ]);
        let bundle = middlewares(&annotations).unwrap();
        assert_eq!(bundle.retry, Some(Retry { attempts: 2 }));
        assert_eq!(
            bundle.circuit_breaker.as_ref().unwrap().expression,
            "NetworkErrorRatio() > 0.5"
        );
        assert!(bundle.rate_limit.is_none());
        assert!(!bundle.is_empty());

        assert!(middlewares(&anns(&[])).unwrap().is_empty());
    }

    #[test]
    fn scheme_defaults_are_callers_business() {
        assert_eq!(scheme(&anns(&[])), Err(AnnotationError::NotFound));
        assert_eq!(
            scheme(&anns(&[("mesh.trellis.io/scheme", "h2c")])),
            Ok(Scheme::H2c)
        );
    }
}
