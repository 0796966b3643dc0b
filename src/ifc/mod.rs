//! Initial Filter Criteria evaluator (spec §4.4).

use crate::sip::SessionCase;
use crate::types::{AsHop, FilterCriterion, IfcConfiguration, ProfilePartIndicator, SessionCaseTag, TriggerExpr};
use tracing::instrument;

/// Minimal view of the request the trigger tree is evaluated against — just what
/// `TriggerExpr`'s atoms need, decoupled from the full `SipRequest` so the evaluator
/// can be unit-tested without constructing one.
pub struct TriggerInput<'a> {
    pub method: &'a str,
    pub session_case: SessionCase,
    pub request_uri: &'a str,
    pub headers: &'a std::collections::HashMap<String, String>,
    pub sdp_lines: &'a [String],
}

fn eval_trigger(expr: &TriggerExpr, input: &TriggerInput) -> bool {
    match expr {
        TriggerExpr::MethodEquals(method) => input.method.eq_ignore_ascii_case(method),
        TriggerExpr::SessionCaseEquals(case) => {
            let want: SessionCaseTag = input.session_case.into();
            *case == want
        }
        TriggerExpr::RequestUriMatches(pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(input.request_uri))
            .unwrap_or(false),
        TriggerExpr::HeaderPresent(name) => input.headers.contains_key(name),
        TriggerExpr::HeaderEquals(name, value) => {
            input.headers.get(name).is_some_and(|v| v == value)
        }
        TriggerExpr::SdpLineMatches(pattern) => regex::Regex::new(pattern)
            .map(|re| input.sdp_lines.iter().any(|line| re.is_match(line)))
            .unwrap_or(false),
        TriggerExpr::And(children) => children.iter().all(|c| eval_trigger(c, input)),
        TriggerExpr::Or(children) => children.iter().any(|c| eval_trigger(c, input)),
        TriggerExpr::Not(child) => !eval_trigger(child, input),
    }
}

fn profile_part_matches(part: ProfilePartIndicator, registered: bool) -> bool {
    match part {
        ProfilePartIndicator::Both => true,
        ProfilePartIndicator::Registered => registered,
        ProfilePartIndicator::Unregistered => !registered,
    }
}

/// Evaluates `config`'s criteria in ascending priority order against `input`, falling
/// back to the FIFC when nothing matches (spec §4.4 contract).
#[instrument(skip_all, fields(session_case = ?input.session_case, registered))]
pub fn matching_ifcs(
    config: &IfcConfiguration,
    input: &TriggerInput,
    registered: bool,
) -> Vec<AsHop> {
    let mut ordered: Vec<&FilterCriterion> = config.criteria.iter().collect();
    ordered.sort_by_key(|c| c.priority);

    warn_on_duplicate_priorities(&ordered);

    let hops: Vec<AsHop> = ordered
        .into_iter()
        .filter(|c| profile_part_matches(c.profile_part, registered))
        .filter(|c| eval_trigger(&c.trigger, input))
        .map(|c| AsHop {
            as_uri: c.as_uri.clone(),
            default_handling: c.default_handling,
            service_info: c.service_info.clone(),
        })
        .collect();

    if hops.is_empty() {
        if let Some(fallback) = &config.fallback_as_uri {
            return vec![AsHop {
                as_uri: fallback.clone(),
                default_handling: crate::types::DefaultHandling::SessionContinued,
                service_info: None,
            }];
        }
    }
    hops
}

fn warn_on_duplicate_priorities(ordered: &[&FilterCriterion]) {
    for window in ordered.windows(2) {
        if window[0].priority == window[1].priority {
            tracing::warn!(
                priority = window[0].priority,
                "duplicate iFC priority; falling back to input-order tie-break"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DefaultHandling;
    use std::collections::HashMap;

    fn hop(uri: &str) -> String {
        uri.to_string()
    }

    #[test]
    fn matches_in_ascending_priority_order() {
        let config = IfcConfiguration {
            criteria: vec![
                FilterCriterion {
                    priority: 2,
                    profile_part: ProfilePartIndicator::Both,
                    trigger: TriggerExpr::MethodEquals("INVITE".into()),
                    as_uri: hop("sip:as2.home.net"),
                    default_handling: DefaultHandling::SessionContinued,
                    service_info: None,
                },
                FilterCriterion {
                    priority: 1,
                    profile_part: ProfilePartIndicator::Both,
                    trigger: TriggerExpr::MethodEquals("INVITE".into()),
                    as_uri: hop("sip:as1.home.net"),
                    default_handling: DefaultHandling::SessionTerminated,
                    service_info: None,
                },
            ],
            fallback_as_uri: None,
        };
        let headers = HashMap::new();
        let input = TriggerInput {
            method: "INVITE",
            session_case: SessionCase::Originating,
            request_uri: "sip:bob@home.net",
            headers: &headers,
            sdp_lines: &[],
        };
        let hops = matching_ifcs(&config, &input, true);
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].as_uri, "sip:as1.home.net");
        assert_eq!(hops[1].as_uri, "sip:as2.home.net");
    }

    #[test]
    fn falls_back_to_fifc_when_nothing_matches() {
        let config = IfcConfiguration {
            criteria: vec![FilterCriterion {
                priority: 1,
                profile_part: ProfilePartIndicator::Both,
                trigger: TriggerExpr::MethodEquals("SUBSCRIBE".into()),
                as_uri: hop("sip:as1.home.net"),
                default_handling: DefaultHandling::SessionContinued,
                service_info: None,
            }],
            fallback_as_uri: Some(hop("sip:fifc.home.net")),
        };
        let headers = HashMap::new();
        let input = TriggerInput {
            method: "INVITE",
            session_case: SessionCase::Originating,
            request_uri: "sip:bob@home.net",
            headers: &headers,
            sdp_lines: &[],
        };
        let hops = matching_ifcs(&config, &input, true);
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].as_uri, "sip:fifc.home.net");
    }

    #[test]
    fn profile_part_filters_by_registration_state() {
        let config = IfcConfiguration {
            criteria: vec![FilterCriterion {
                priority: 1,
                profile_part: ProfilePartIndicator::Registered,
                trigger: TriggerExpr::MethodEquals("INVITE".into()),
                as_uri: hop("sip:as1.home.net"),
                default_handling: DefaultHandling::SessionContinued,
                service_info: None,
            }],
            fallback_as_uri: None,
        };
        let headers = HashMap::new();
        let input = TriggerInput {
            method: "INVITE",
            session_case: SessionCase::Originating,
            request_uri: "sip:bob@home.net",
            headers: &headers,
            sdp_lines: &[],
        };
        assert!(matching_ifcs(&config, &input, false).is_empty());
        assert_eq!(matching_ifcs(&config, &input, true).len(), 1);
    }
}
