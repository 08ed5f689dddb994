//! Recursive deep merge for delta status trees.

use serde_json::Value;

/// Merge `delta` into `base`.
///
/// Maps merge key by key, recursing where both sides are maps. Everything
/// else — scalars, arrays, nulls — replaces the base value wholesale. Arrays
/// are never element-merged; `exception_status` and `canvas_list` semantics
/// depend on that.
pub fn deep_merge(base: &mut Value, delta: &Value) {
    match (base, delta) {
        (Value::Object(base_map), Value::Object(delta_map)) => {
            for (key, incoming) in delta_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, incoming),
                    None => {
                        base_map.insert(key.clone(), incoming.clone());
                    }
                }
            }
        }
        (slot, incoming) => {
            *slot = incoming.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_merge_recursively() {
        let mut base = json!({
            "temps": {"nozzle": 200.0, "bed": 60.0},
            "status": 1
        });
        deep_merge(&mut base, &json!({"temps": {"nozzle": 210.0}}));
        assert_eq!(base["temps"]["nozzle"], 210.0);
        assert_eq!(base["temps"]["bed"], 60.0);
        assert_eq!(base["status"], 1);
    }

    #[test]
    fn arrays_replace_wholesale() {
        let mut base = json!({"exception_status": [1, 2, 3]});
        deep_merge(&mut base, &json!({"exception_status": [9]}));
        assert_eq!(base["exception_status"], json!([9]));
    }

    #[test]
    fn scalars_replace_and_new_keys_insert() {
        let mut base = json!({"a": 1});
        deep_merge(&mut base, &json!({"a": 2, "b": {"c": true}}));
        assert_eq!(base["a"], 2);
        assert_eq!(base["b"]["c"], true);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut base = json!({"x": {"y": 1}, "list": [1, 2]});
        let delta = json!({"x": {"y": 2, "z": 3}, "list": [3]});
        deep_merge(&mut base, &delta);
        let once = base.clone();
        deep_merge(&mut base, &delta);
        assert_eq!(base, once);
    }

    #[test]
    fn empty_delta_is_identity() {
        let mut base = json!({"x": {"y": 1}, "list": [1, 2]});
        let before = base.clone();
        deep_merge(&mut base, &json!({}));
        assert_eq!(base, before);
    }

    #[test]
    fn unknown_fields_survive() {
        let mut base = json!({"status": 0});
        deep_merge(&mut base, &json!({"firmware_2030_feature": {"flag": 1}}));
        assert_eq!(base["firmware_2030_feature"]["flag"], 1);
    }
}
