//! Recursive merge over YAML values: dict+dict merges field-by-field, list+list
//! concatenates, anything else is an overwrite by the right-hand side.

use serde_yaml::Value;

/// Merge `overlay` onto `base`, returning a new value. `base` is the lower
/// precedence side; `overlay` wins on any non-structural collision.
pub fn recursive_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                match merged.get(key) {
                    Some(base_value) => {
                        let new_value = recursive_merge(base_value, overlay_value);
                        merged.insert(key.clone(), new_value);
                    }
                    None => {
                        merged.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
            Value::Mapping(merged)
        }
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => {
            let mut merged = base_seq.clone();
            merged.extend(overlay_seq.iter().cloned());
            Value::Sequence(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

/// Merge three layers in ascending precedence: global defaults, then rule
/// defaults, then the concrete entry.
pub fn merge_layers(global_defaults: &Value, rule_defaults: &Value, entry: &Value) -> Value {
    recursive_merge(&recursive_merge(global_defaults, rule_defaults), entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Mapping;

    fn map(pairs: &[(&str, Value)]) -> Value {
        let mut m = Mapping::new();
        for (k, v) in pairs {
            m.insert(Value::from(*k), v.clone());
        }
        Value::Mapping(m)
    }

    #[test]
    fn dict_merge_is_field_by_field() {
        let base = map(&[("a", Value::from(1)), ("b", Value::from(2))]);
        let overlay = map(&[("b", Value::from(3)), ("c", Value::from(4))]);
        let merged = recursive_merge(&base, &overlay);
        assert_eq!(merged, map(&[("a", Value::from(1)), ("b", Value::from(3)), ("c", Value::from(4))]));
    }

    #[test]
    fn list_merge_concatenates() {
        let base = Value::Sequence(vec![Value::from(1), Value::from(2)]);
        let overlay = Value::Sequence(vec![Value::from(3)]);
        let merged = recursive_merge(&base, &overlay);
        assert_eq!(merged, Value::Sequence(vec![Value::from(1), Value::from(2), Value::from(3)]));
    }

    #[test]
    fn scalar_collision_overwrites() {
        let base = Value::from("old");
        let overlay = Value::from("new");
        assert_eq!(recursive_merge(&base, &overlay), Value::from("new"));
    }

    #[test]
    fn nested_dict_merges_recursively() {
        let base = map(&[("outer", map(&[("x", Value::from(1))]))]);
        let overlay = map(&[("outer", map(&[("y", Value::from(2))]))]);
        let merged = recursive_merge(&base, &overlay);
        assert_eq!(merged, map(&[("outer", map(&[("x", Value::from(1)), ("y", Value::from(2))]))]));
    }

    #[test]
    fn three_layer_merge_respects_precedence() {
        let global = map(&[("a", Value::from(1)), ("b", Value::from(1))]);
        let rule = map(&[("b", Value::from(2)), ("c", Value::from(2))]);
        let entry = map(&[("c", Value::from(3))]);
        let merged = merge_layers(&global, &rule, &entry);
        assert_eq!(
            merged,
            map(&[("a", Value::from(1)), ("b", Value::from(2)), ("c", Value::from(3))])
        );
    }
}
