//! Topic contract shared by the manager and the monitor, plus the
//! first-match router both processes use to dispatch incoming publishes.

// ---------------------------------------------------------------------------
// Topic names
// ---------------------------------------------------------------------------

/// Retained JSON array of every sensor the manager knows about.
pub const SENSORS_INFO: &str = "sensors/info";
/// Single sensor definition, published by the monitor for unknown hardware.
pub const SENSORS_CONFIG: &str = "sensors/config";
/// Single plant definition, published by a config UI.
pub const PLANTS_CONFIG: &str = "plants/config";

pub const SENSORS_DATA_ALL: &str = "sensors/data/+";
pub const PUMPS_CONTROL_ALL: &str = "pumps/control/+";
pub const STATUS_ALL: &str = "status/+";

pub fn sensor_data(sensor_id: i64) -> String {
    format!("sensors/data/{sensor_id}")
}

pub fn pump_control(pump_id: i64) -> String {
    format!("pumps/control/{pump_id}")
}

pub fn status(process: &str) -> String {
    format!("status/{process}")
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Match `topic` against an MQTT subscription `pattern`.
///
/// `+` matches exactly one level, a trailing `#` matches zero or more
/// levels. On a match, returns the topic levels captured by wildcards in
/// order; `#` captures the remainder as one string.
pub fn capture<'t>(pattern: &str, topic: &'t str) -> Option<Vec<&'t str>> {
    let mut captures = Vec::new();
    let mut topic_levels = topic.split('/');
    let mut consumed = 0usize;
    let mut pattern_levels = pattern.split('/').peekable();

    while let Some(level) = pattern_levels.next() {
        if level == "#" {
            // Only valid as the last level of a pattern.
            if pattern_levels.peek().is_some() {
                return None;
            }
            let rest = &topic[consumed.min(topic.len())..];
            if !rest.is_empty() {
                captures.push(rest);
            }
            return Some(captures);
        }

        let head = topic_levels.next()?;
        consumed += head.len() + 1;

        match level {
            "+" => captures.push(head),
            literal if literal == head => {}
            _ => return None,
        }
    }

    // Pattern exhausted: the topic must be too.
    match topic_levels.next() {
        Some(_) => None,
        None => Some(captures),
    }
}

pub fn matches(pattern: &str, topic: &str) -> bool {
    capture(pattern, topic).is_some()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// First-match dispatch table. Each registration pairs a pattern with a
/// route tag; `route` hands back the tag of the earliest registration
/// whose pattern matches, so exactly one handler runs per message.
#[derive(Debug, Clone)]
pub struct Router<R> {
    routes: Vec<(String, R)>,
}

impl<R: Copy> Router<R> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn on(mut self, pattern: impl Into<String>, route: R) -> Self {
        self.routes.push((pattern.into(), route));
        self
    }

    /// Patterns in registration order, for subscribing.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(p, _)| p.as_str())
    }

    pub fn route<'t>(&self, topic: &'t str) -> Option<(R, Vec<&'t str>)> {
        self.routes
            .iter()
            .find_map(|(pattern, route)| capture(pattern, topic).map(|caps| (*route, caps)))
    }
}

impl<R: Copy> Default for Router<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the numeric id captured from a topic like `sensors/data/7`.
pub fn parse_id(segment: &str) -> Option<i64> {
    segment.trim().parse().ok()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Route {
        Data,
        Info,
        Anything,
    }

    // -- capture / matches --------------------------------------------------

    #[test]
    fn plus_matches_single_level() {
        assert_eq!(capture("sensors/data/+", "sensors/data/7"), Some(vec!["7"]));
    }

    #[test]
    fn plus_does_not_match_multiple_levels() {
        assert!(!matches("sensors/data/+", "sensors/data/7/extra"));
    }

    #[test]
    fn plus_requires_a_level() {
        assert!(!matches("sensors/data/+", "sensors/data"));
    }

    #[test]
    fn literal_topic_matches_itself_only() {
        assert!(matches("sensors/info", "sensors/info"));
        assert!(!matches("sensors/info", "sensors/config"));
        assert!(!matches("sensors/info", "sensors/info/x"));
        assert!(!matches("sensors/info/x", "sensors/info"));
    }

    #[test]
    fn hash_matches_remainder() {
        assert_eq!(
            capture("pumps/control/#", "pumps/control/2"),
            Some(vec!["2"])
        );
        assert_eq!(
            capture("pumps/#", "pumps/control/2"),
            Some(vec!["control/2"])
        );
        assert_eq!(capture("pumps/#", "pumps"), Some(vec![]));
    }

    #[test]
    fn hash_must_be_last() {
        assert!(!matches("pumps/#/control", "pumps/a/control"));
    }

    #[test]
    fn multiple_wildcards_capture_in_order() {
        assert_eq!(capture("+/data/+", "sensors/data/5"), Some(vec!["sensors", "5"]));
    }

    #[test]
    fn empty_topic_does_not_match_literal() {
        assert!(!matches("status/+", ""));
    }

    // -- Router -------------------------------------------------------------

    #[test]
    fn router_first_registration_wins() {
        let router = Router::new()
            .on(SENSORS_DATA_ALL, Route::Data)
            .on("#", Route::Anything);
        assert_eq!(router.route("sensors/data/3"), Some((Route::Data, vec!["3"])));
        assert_eq!(
            router.route("sensors/info").map(|(r, _)| r),
            Some(Route::Anything)
        );
    }

    #[test]
    fn router_unmatched_topic_is_none() {
        let router = Router::new()
            .on(SENSORS_DATA_ALL, Route::Data)
            .on(SENSORS_INFO, Route::Info);
        assert_eq!(router.route("plants/config"), None);
    }

    #[test]
    fn router_lists_patterns_in_order() {
        let router = Router::new()
            .on(SENSORS_INFO, Route::Info)
            .on(SENSORS_DATA_ALL, Route::Data);
        let patterns: Vec<&str> = router.patterns().collect();
        assert_eq!(patterns, vec![SENSORS_INFO, SENSORS_DATA_ALL]);
    }

    // -- Topic builders -----------------------------------------------------

    #[test]
    fn topic_builders_round_trip_through_router() {
        let router = Router::new().on(PUMPS_CONTROL_ALL, Route::Data);
        let topic = pump_control(4);
        let (_, caps) = router.route(&topic).unwrap();
        assert_eq!(parse_id(caps[0]), Some(4));
        assert_eq!(sensor_data(12), "sensors/data/12");
        assert_eq!(status("garden_monitor"), "status/garden_monitor");
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert_eq!(parse_id("abc"), None);
        assert_eq!(parse_id(""), None);
    }
}
