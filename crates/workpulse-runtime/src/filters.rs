use serde_json::Value;
use std::cmp::Ordering;

/// Default fold: the buffered values, unchanged, as one array.
pub fn identity(values: Vec<Value>) -> Value {
    Value::Array(values)
}

/// Flattens one level of arrays, drops duplicates and sorts the rest.
pub fn dedupe_sorted(values: Vec<Value>) -> Value {
    let mut flat = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Array(items) => flat.extend(items),
            other => flat.push(other),
        }
    }
    flat.sort_by(compare_values);
    flat.dedup();
    Value::Array(flat)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or_default();
            let b = b.as_f64().unwrap_or_default();
            a.partial_cmp(&b)
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.to_string().cmp(&right.to_string()))
        }
        _ => type_rank(left)
            .cmp(&type_rank(right))
            .then_with(|| left.to_string().cmp(&right.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_and_float_spellings_stay_distinct_without_repeats() {
        assert_eq!(
            dedupe_sorted(vec![json!([1, 1.0]), json!([1, 2]), json!(1.0)]),
            json!([1, 1.0, 2])
        );
    }

    #[test]
    fn identity_keeps_order_and_duplicates() {
        assert_eq!(
            identity(vec![json!("b"), json!("a"), json!("b")]),
            json!(["b", "a", "b"])
        );
    }

    #[test]
    fn dedupe_sorted_flattens_one_level() {
        let values = vec![json!(["x2", "x1"]), json!("x1"), json!(["x3", ["nested"]])];
        assert_eq!(
            dedupe_sorted(values),
            json!(["x1", "x2", "x3", ["nested"]])
        );
    }

    #[test]
    fn dedupe_sorted_orders_mixed_types() {
        let values = vec![json!(3), json!("a"), json!(1), json!(null), json!(3)];
        assert_eq!(dedupe_sorted(values), json!([null, 1, 3, "a"]));
    }
}
