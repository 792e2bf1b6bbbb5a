//! Mapping between bridge values and JSON
//!
//! Plain JSON covers None, bools, numbers, strings, lists and string-keyed
//! dicts. Everything else uses a single-key object:
//! `{"$tuple": [..]}`, `{"$dict": [[k, v], ..]}`, `{"$complex": [re, im]}`,
//! `{"$int": "digits"}`, `{"$float": "nan"}`,
//! `{"$ndarray": {"shape": [..], "data": [..]}}` and
//! `{"$handle": id, "type": "module.Class"}`.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use pyrelay_core::{NdArray, RemoteObject, Value};
use serde_json::{json, Map, Number, Value as Json};

/// Handles handed out to the client, kept alive until released.
pub type HandleMap = HashMap<u64, RemoteObject>;

pub fn to_json(value: Value, handles: &mut HandleMap) -> Json {
    match value {
        Value::None => Json::Null,
        Value::Bool(v) => Json::Bool(v),
        Value::Int(v) => match i64::try_from(v) {
            Ok(small) => Json::from(small),
            Err(_) => json!({ "$int": v.to_string() }),
        },
        Value::Float(v) => float_to_json(v),
        Value::Rational { numer, denom } => float_to_json(numer as f64 / denom as f64),
        Value::Complex { re, im } => json!({ "$complex": [float_to_json(re), float_to_json(im)] }),
        Value::Str(s) => Json::String(s),
        Value::List(items) => Json::Array(items.into_iter().map(|v| to_json(v, handles)).collect()),
        Value::Tuple(items) => {
            let items: Vec<Json> = items.into_iter().map(|v| to_json(v, handles)).collect();
            json!({ "$tuple": items })
        }
        Value::Dict(entries) => {
            if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                let mut map = Map::new();
                for (k, v) in entries {
                    if let Value::Str(key) = k {
                        map.insert(key, to_json(v, handles));
                    }
                }
                Json::Object(map)
            } else {
                let pairs: Vec<Json> = entries
                    .into_iter()
                    .map(|(k, v)| Json::Array(vec![to_json(k, handles), to_json(v, handles)]))
                    .collect();
                json!({ "$dict": pairs })
            }
        }
        Value::Array(array) => {
            let shape = array.shape().to_vec();
            let data: Vec<Json> = array
                .into_data()
                .into_iter()
                .map(|v| to_json(v, handles))
                .collect();
            json!({ "$ndarray": { "shape": shape, "data": data } })
        }
        Value::Remote(handle) => {
            let out = json!({ "$handle": handle.id(), "type": handle.type_name() });
            handles.insert(handle.id(), handle);
            out
        }
        // The server never sends host objects, so none can come back.
        Value::Host(object) => json!({ "$host": object.type_name() }),
    }
}

fn float_to_json(v: f64) -> Json {
    if let Some(n) = Number::from_f64(v) {
        return Json::Number(n);
    }
    let name = if v.is_nan() {
        "nan"
    } else if v > 0.0 {
        "inf"
    } else {
        "-inf"
    };
    json!({ "$float": name })
}

pub fn from_json(json: &Json, handles: &HandleMap) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::None,
        Json::Bool(v) => Value::Bool(*v),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::Int(v.into())
            } else if let Some(v) = n.as_u64() {
                Value::Int(v.into())
            } else {
                Value::Float(n.as_f64().ok_or_else(|| anyhow!("unrepresentable number {}", n))?)
            }
        }
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => Value::List(from_json_seq(items, handles)?),
        Json::Object(map) => from_json_object(map, handles)?,
    })
}

fn from_json_seq(items: &[Json], handles: &HandleMap) -> Result<Vec<Value>> {
    items.iter().map(|item| from_json(item, handles)).collect()
}

fn from_json_object(map: &Map<String, Json>, handles: &HandleMap) -> Result<Value> {
    if let Some(id) = map.get("$handle") {
        let id = id.as_u64().context("$handle must be a non-negative integer")?;
        let handle = handles
            .get(&id)
            .with_context(|| format!("unknown or released handle {}", id))?;
        return Ok(Value::Remote(handle.clone()));
    }

    let tagged = map.iter().next().filter(|_| map.len() == 1);
    match tagged {
        Some((tag, body)) if tag == "$tuple" => {
            let items = body.as_array().context("$tuple must hold a list")?;
            Ok(Value::Tuple(from_json_seq(items, handles)?))
        }
        Some((tag, body)) if tag == "$dict" => {
            let pairs = body.as_array().context("$dict must hold a list of pairs")?;
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                match pair.as_array().map(Vec::as_slice) {
                    Some([k, v]) => entries.push((from_json(k, handles)?, from_json(v, handles)?)),
                    _ => bail!("$dict entries must be [key, value] pairs"),
                }
            }
            Ok(Value::Dict(entries))
        }
        Some((tag, body)) if tag == "$complex" => match body.as_array().map(Vec::as_slice) {
            Some([re, im]) => Ok(Value::Complex {
                re: json_float(re)?,
                im: json_float(im)?,
            }),
            _ => bail!("$complex must hold [re, im]"),
        },
        Some((tag, body)) if tag == "$int" => {
            let digits = body.as_str().context("$int must hold a string of digits")?;
            let v = digits
                .parse::<i128>()
                .with_context(|| format!("$int {:?} is not a 128-bit integer", digits))?;
            Ok(Value::Int(v))
        }
        Some((tag, body)) if tag == "$float" => Ok(Value::Float(json_float(&json!({ "$float": body }))?)),
        Some((tag, body)) if tag == "$ndarray" => {
            let shape = body
                .get("shape")
                .and_then(Json::as_array)
                .context("$ndarray needs a shape list")?
                .iter()
                .map(|d| {
                    d.as_u64()
                        .map(|d| d as usize)
                        .context("$ndarray shape entries must be non-negative integers")
                })
                .collect::<Result<Vec<_>>>()?;
            let data = body
                .get("data")
                .and_then(Json::as_array)
                .context("$ndarray needs a data list")?;
            Ok(Value::Array(NdArray::new(shape, from_json_seq(data, handles)?)?))
        }
        _ => {
            let entries = map
                .iter()
                .map(|(k, v)| Ok((Value::Str(k.clone()), from_json(v, handles)?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Dict(entries))
        }
    }
}

fn json_float(json: &Json) -> Result<f64> {
    if let Some(v) = json.as_f64() {
        return Ok(v);
    }
    match json.get("$float").and_then(Json::as_str) {
        Some("nan") => Ok(f64::NAN),
        Some("inf") => Ok(f64::INFINITY),
        Some("-inf") => Ok(f64::NEG_INFINITY),
        _ => bail!("expected a number, got {}", json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyrelay_core::handles::HandleTable;

    fn back_and_forth(value: Value) -> Value {
        let mut handles = HandleMap::new();
        let json = to_json(value, &mut handles);
        from_json(&json, &handles).unwrap()
    }

    #[test]
    fn test_plain_json() {
        let handles = HandleMap::new();
        let value = from_json(&json!({"a": [1, 2.5, null, true, "x"]}), &handles).unwrap();
        assert_eq!(
            value,
            Value::Dict(vec![(
                Value::from("a"),
                Value::List(vec![
                    Value::Int(1),
                    Value::Float(2.5),
                    Value::None,
                    Value::Bool(true),
                    Value::from("x"),
                ])
            )])
        );
    }

    #[test]
    fn test_tagged_values_survive() {
        for value in [
            Value::Tuple(vec![Value::Int(1), Value::from("two")]),
            Value::Complex { re: 1.0, im: -0.5 },
            Value::Int(i128::MAX),
            Value::Float(f64::NEG_INFINITY),
            Value::Dict(vec![(Value::Int(1), Value::None)]),
            Value::Array(NdArray::from_i64(vec![2, 2], [1, 2, 3, 4]).unwrap()),
        ] {
            assert_eq!(back_and_forth(value.clone()), value);
        }
        assert!(matches!(back_and_forth(Value::Float(f64::NAN)), Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn test_handles_are_tracked() {
        let table = HandleTable::new();
        let handle = table.intern(4, "__main__.Box");
        let mut handles = HandleMap::new();

        let json = to_json(Value::Remote(handle.clone()), &mut handles);
        assert_eq!(json, json!({"$handle": 4, "type": "__main__.Box"}));
        assert!(handles.contains_key(&4));

        assert_eq!(from_json(&json, &handles).unwrap(), Value::Remote(handle));
        handles.clear();
        assert!(from_json(&json, &handles).is_err());
    }

    #[test]
    fn test_malformed_tags() {
        let handles = HandleMap::new();
        assert!(from_json(&json!({"$complex": [1]}), &handles).is_err());
        assert!(from_json(&json!({"$ndarray": {"shape": [3], "data": [1]}}), &handles).is_err());
        assert!(from_json(&json!({"$int": "12x"}), &handles).is_err());
        // Only single-key objects are tagged.
        assert_eq!(
            from_json(&json!({"$tuple": [], "other": 1}), &handles)
                .unwrap()
                .get("other"),
            Some(&Value::Int(1))
        );
    }
}
