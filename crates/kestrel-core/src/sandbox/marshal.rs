//! Conversion between JSON values and guest values

use rquickjs::{Array, Ctx, Object, Value};
use serde_json::{Map, Number, Value as Json};

/// Largest integer a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Build the guest representation of a JSON value.
///
/// JSON input is a tree, so recursion terminates without a depth guard.
/// Numbers become doubles, so integers beyond ±2^53 lose precision and
/// come back out as the nearest float.
pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Json) -> rquickjs::Result<Value<'js>> {
    Ok(match value {
        Json::Null => Value::new_null(ctx.clone()),
        Json::Bool(b) => Value::new_bool(ctx.clone(), *b),
        Json::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(int) => Value::new_int(ctx.clone(), int),
            None => Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        Json::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, json_to_js(ctx, item)?)?;
            }
            array.into_value()
        }
        Json::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                object.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            object.into_value()
        }
    })
}

/// Read a guest value back into JSON.
///
/// Functions, symbols and `undefined` become `null`, as do non-finite
/// numbers. Nesting deeper than `max_depth` is cut off with `null`, which
/// also bounds self-referencing guest objects.
pub(crate) fn js_to_json(value: &Value<'_>, max_depth: usize) -> Json {
    convert(value, 0, max_depth)
}

fn convert(value: &Value<'_>, depth: usize, max_depth: usize) -> Json {
    if depth > max_depth {
        return Json::Null;
    }
    if value.is_undefined() || value.is_null() || value.is_function() {
        return Json::Null;
    }
    if let Some(b) = value.as_bool() {
        return Json::Bool(b);
    }
    if let Some(int) = value.as_int() {
        return Json::from(int);
    }
    if let Some(float) = value.as_float() {
        return float_to_json(float);
    }
    if let Some(s) = value.as_string() {
        return s.to_string().map(Json::String).unwrap_or(Json::Null);
    }
    if let Some(array) = value.as_array() {
        return Json::Array(
            array
                .iter::<Value>()
                .map(|item| {
                    item.map(|v| convert(&v, depth + 1, max_depth))
                        .unwrap_or(Json::Null)
                })
                .collect(),
        );
    }
    if let Some(object) = value.as_object() {
        if value.is_error() {
            return error_to_json(object);
        }
        let mut map = Map::new();
        for prop in object.props::<String, Value>() {
            let Ok((key, item)) = prop else {
                continue;
            };
            map.insert(key, convert(&item, depth + 1, max_depth));
        }
        return Json::Object(map);
    }
    Json::Null
}

fn float_to_json(float: f64) -> Json {
    if float.fract() == 0.0 && float.abs() <= MAX_SAFE_INTEGER {
        return Json::from(float as i64);
    }
    Number::from_f64(float).map(Json::Number).unwrap_or(Json::Null)
}

fn error_to_json(object: &Object<'_>) -> Json {
    let mut map = Map::new();
    for key in ["name", "message"] {
        if let Ok(Some(text)) = object.get::<_, Option<String>>(key) {
            map.insert(key.to_string(), Json::String(text));
        }
    }
    Json::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_ctx<R>(f: impl FnOnce(Ctx<'_>) -> R) -> R {
        let runtime = Runtime::new().expect("runtime");
        let context = Context::full(&runtime).expect("context");
        context.with(f)
    }

    #[test]
    fn json_values_round_trip() {
        let samples = [
            json!(null),
            json!(true),
            json!(-17),
            json!(2.5),
            json!(4_294_967_296_i64),
            json!("héllo"),
            json!([1, "two", [3.5, null], {"four": false}]),
            json!({"nested": {"list": [], "empty": {}, "text": ""}}),
        ];
        with_ctx(|ctx| {
            for sample in &samples {
                let guest = json_to_js(&ctx, sample).expect("marshal");
                assert_eq!(&js_to_json(&guest, 64), sample);
            }
        });
    }

    #[test]
    fn integers_past_the_safe_range_come_back_as_floats() {
        with_ctx(|ctx| {
            let guest = json_to_js(&ctx, &json!(9_007_199_254_740_993_u64)).expect("marshal");
            let back = js_to_json(&guest, 64);
            assert_eq!(back.as_u64(), None);
            assert_eq!(back.as_f64(), Some(9_007_199_254_740_992.0));

            let safe = json_to_js(&ctx, &json!(9_007_199_254_740_991_i64)).expect("marshal");
            assert_eq!(js_to_json(&safe, 64), json!(9_007_199_254_740_991_i64));
        });
    }

    #[test]
    fn unrepresentable_guest_values_become_null() {
        with_ctx(|ctx| {
            let value: Value = ctx
                .eval("({ f: () => 1, u: undefined, n: NaN, i: Infinity, s: Symbol('x') })")
                .expect("eval");
            assert_eq!(
                js_to_json(&value, 64),
                json!({"f": null, "u": null, "n": null, "i": null, "s": null})
            );
        });
    }

    #[test]
    fn cyclic_guest_objects_are_cut_at_the_depth_limit() {
        with_ctx(|ctx| {
            let value: Value = ctx.eval("const a = { v: 1 }; a.self = a; a").expect("eval");
            let json = js_to_json(&value, 2);
            assert_eq!(json["v"], json!(1));
            assert_eq!(json["self"]["self"]["self"], json!(null));
        });
    }
}
