//! Placeholder substitution over template bodies.
//!
//! Walks the body as a JSON tree and rewrites every string leaf (and every
//! object key): `$placeholder` tokens are replaced with the bound value,
//! and a result of the form `<int> <op> <int>` is folded as 64-bit signed
//! arithmetic. A string leaf that is exactly one placeholder takes the
//! bound value's own type, so numeric detector properties stay numbers.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

static ARITHMETIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(-?\d+)\s*([+\-*/%])\s*(-?\d+)\s*$").unwrap());

/// Bound placeholder values for one probe match.
pub type Replacements = BTreeMap<String, Value>;

/// Substitute placeholders throughout a JSON tree, keys included.
pub fn substitute(value: &mut Value, replacements: &Replacements) {
    match value {
        Value::String(s) => {
            *value = substitute_leaf(s, replacements);
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, replacements);
            }
        }
        Value::Object(map) => {
            let entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            for (key, mut entry) in entries {
                substitute(&mut entry, replacements);
                let new_key = match substitute_leaf(&key, replacements) {
                    Value::String(s) => s,
                    other => string_form(&other),
                };
                map.insert(new_key, entry);
            }
        }
        _ => {}
    }
}

/// Substitute one string leaf.
fn substitute_leaf(input: &str, replacements: &Replacements) -> Value {
    // An exact single-placeholder leaf keeps the bound value's type.
    if let Some(name) = input.strip_prefix('$') {
        if let Some(bound) = replacements.get(name) {
            return bound.clone();
        }
    }

    let mut result = input.to_string();
    // Longest names first so "$Foo" never clips a "$FooBar" occurrence.
    let mut names: Vec<&String> = replacements.keys().collect();
    names.sort_by_key(|n| std::cmp::Reverse(n.len()));

    for name in names {
        let token = format!("${}", name);
        let mut search = 0;
        while let Some(found) = result[search..].find(&token) {
            let at = search + found;
            let end = at + token.len();
            let boundary = result[end..]
                .chars()
                .next()
                .map(|c| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(true);
            if boundary {
                let bound = string_form(&replacements[name.as_str()]);
                result.replace_range(at..end, &bound);
                search = at + bound.len();
            } else {
                search = end;
            }
        }
    }

    if let Some(captures) = ARITHMETIC.captures(&result) {
        let lhs: i64 = captures[1].parse().unwrap_or(0);
        let rhs: i64 = captures[3].parse().unwrap_or(0);
        let folded = match &captures[2] {
            "+" => lhs.checked_add(rhs),
            "-" => lhs.checked_sub(rhs),
            "*" => lhs.checked_mul(rhs),
            "/" => lhs.checked_div(rhs),
            "%" => lhs.checked_rem(rhs),
            _ => None,
        };
        match folded {
            Some(n) => return Value::from(n),
            None => {
                warn!(expression = %result, "Arithmetic on substituted value failed");
            }
        }
    }

    Value::String(result)
}

/// String form of a bound value, as used inside larger strings.
pub fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Synthesize the canonical entity id for one match: the template's
/// `Name` after substitution, then the match's sorted replacement
/// pairs. An empty binding yields the bare name.
pub fn entity_id(template_name: &str, replacements: &Replacements) -> String {
    let mut name = Value::from(template_name);
    substitute(&mut name, replacements);
    let name = string_form(&name);
    if replacements.is_empty() {
        return name;
    }
    let pairs: Vec<String> = replacements
        .iter()
        .map(|(k, v)| format!("{}={}", k, string_form(v)))
        .collect();
    format!("{} {}", name, pairs.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repl(pairs: &[(&str, Value)]) -> Replacements {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn replaces_inside_strings() {
        let mut body = json!({"Name": "Board $BOARD_NAME rev $REV"});
        substitute(
            &mut body,
            &repl(&[("BOARD_NAME", json!("X1")), ("REV", json!(3))]),
        );
        assert_eq!(body["Name"], json!("Board X1 rev 3"));
    }

    #[test]
    fn exact_placeholder_keeps_value_type() {
        let mut body = json!({"Address": "$address", "Label": "$name"});
        substitute(
            &mut body,
            &repl(&[("address", json!(83)), ("name", json!("fan"))]),
        );
        assert_eq!(body["Address"], json!(83));
        assert_eq!(body["Label"], json!("fan"));
    }

    #[test]
    fn longest_placeholder_wins() {
        let mut body = json!({"V": "$BUS_NR and $BUS"});
        substitute(&mut body, &repl(&[("BUS", json!(1)), ("BUS_NR", json!(2))]));
        assert_eq!(body["V"], json!("2 and 1"));
    }

    #[test]
    fn arithmetic_folds_to_number() {
        let cases = [
            ("$i + 1", json!(5)),
            ("$i - 6", json!(-2)),
            ("$i * 3", json!(12)),
            ("$i / 2", json!(2)),
            ("$i % 3", json!(1)),
        ];
        for (input, expected) in cases {
            let mut body = json!({ "V": input });
            substitute(&mut body, &repl(&[("i", json!(4))]));
            assert_eq!(body["V"], expected, "for {}", input);
        }
    }

    #[test]
    fn division_by_zero_leaves_string() {
        let mut body = json!({"V": "$i / 0"});
        substitute(&mut body, &repl(&[("i", json!(4))]));
        assert_eq!(body["V"], json!("4 / 0"));
    }

    #[test]
    fn keys_are_substituted() {
        let mut body = json!({"Sensor$index": {"Reading": "$index"}});
        substitute(&mut body, &repl(&[("index", json!(2))]));
        assert_eq!(body["Sensor2"]["Reading"], json!(2));
    }

    #[test]
    fn unbound_placeholders_survive() {
        let mut body = json!({"V": "$unbound"});
        substitute(&mut body, &repl(&[("i", json!(1))]));
        assert_eq!(body["V"], json!("$unbound"));
    }

    #[test]
    fn id_synthesis_substitutes_the_name() {
        assert_eq!(entity_id("X", &Replacements::new()), "X");
        let id = entity_id(
            "Board $M",
            &repl(&[("M", json!("Acme")), ("index", json!(0))]),
        );
        assert_eq!(id, "Board Acme M=Acme index=0");

        let id = entity_id("Drive $index", &repl(&[("index", json!(2))]));
        assert_eq!(id, "Drive 2 index=2");
    }

    #[test]
    fn numeric_leaves_untouched() {
        let mut body = json!({"N": 5, "F": 1.5});
        substitute(&mut body, &repl(&[("i", json!(1))]));
        assert_eq!(body["N"], json!(5));
        assert_eq!(body["F"], json!(1.5));
    }
}
