use crate::config::{ScenarioConfig, ServerConfig};
use std::collections::HashMap;

/// Find the scenario whose match key for the greeting verb equals the
/// identity the peer introduced itself with. First match wins; the
/// scenario map is immutable after startup so this is a shared read.
pub fn match_scenario<'a>(
    config: &'a ServerConfig,
    verb: &str,
    identity: &str,
) -> Option<&'a ScenarioConfig> {
    config.scenarios.values().find(|scenario| {
        let key = if verb.eq_ignore_ascii_case("HELO") {
            scenario.helo.as_deref()
        } else if verb.eq_ignore_ascii_case("LHLO") {
            scenario.lhlo.as_deref()
        } else if verb.eq_ignore_ascii_case("EHLO") {
            scenario.ehlo.as_deref()
        } else {
            None
        };
        key.map(|k| k.eq_ignore_ascii_case(identity)).unwrap_or(false)
    })
}

/// Substitute literal `{$name}` tokens from the magic-variable map.
/// Unknown tokens are left in place so a test author can see what
/// didn't resolve.
pub fn render(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{$") {
        out.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + end + 1]),
                }
                rest = &rest[start + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
