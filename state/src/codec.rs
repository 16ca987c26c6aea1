//! Identity-preserving JSON codec for continuation states.
//!
//! The wire form is a flattened, head-first frame list plus a tagged value
//! encoding. Reference values are written once under a tracker-assigned id
//! and thereafter as `{"ref": id}`, so shared references (and even a
//! malformed cyclic chain) survive the trip; the validator decides what is
//! actually restorable.

use molt_types::{ContinuationState, FrameRecord, FrameRef, TypeSig, Value};
use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::StateError;
use crate::tracker::ObjectGraphTracker;

/// Encodes a continuation state to bytes.
pub fn encode(state: &ContinuationState) -> Result<Vec<u8>, StateError> {
    let mut tracker = ObjectGraphTracker::new();
    let yielded = encode_value(&state.yielded_value, &mut tracker)?;

    // Flatten head-first; a cyclic chain terminates when a frame repeats.
    let mut order: Vec<FrameRef> = Vec::new();
    let mut fid_of: HashMap<*const std::cell::RefCell<FrameRecord>, usize> = HashMap::new();
    let mut cursor = state.stack_head.clone();
    while let Some(frame) = cursor {
        if fid_of.contains_key(&Rc::as_ptr(&frame)) {
            break;
        }
        fid_of.insert(Rc::as_ptr(&frame), order.len());
        cursor = frame.borrow().caller.clone();
        order.push(frame);
    }

    let mut frames = Vec::with_capacity(order.len());
    for (fid, frame) in order.iter().enumerate() {
        let record = frame.borrow();
        let mut slots = Vec::with_capacity(record.slots.len());
        for slot in &record.slots {
            slots.push(encode_value(slot, &mut tracker)?);
        }
        let caller = record
            .caller
            .as_ref()
            .map(|caller| fid_of[&Rc::as_ptr(caller)]);
        frames.push(json!({
            "fid": fid,
            "method_token": record.method_token,
            "yield_point_id": record.yield_point_id,
            "slots": slots,
            "caller": caller,
        }));
    }

    let root = json!({
        "version": state.version,
        "yielded": yielded,
        "stack": frames,
    });
    serde_json::to_vec(&root).map_err(|e| StateError::Encode(e.to_string()))
}

/// Decodes a continuation state from bytes.
pub fn decode(bytes: &[u8]) -> Result<ContinuationState, StateError> {
    let root: Json =
        serde_json::from_slice(bytes).map_err(|e| StateError::Decode(e.to_string()))?;
    let version = root
        .get("version")
        .and_then(Json::as_i64)
        .ok_or_else(|| StateError::Decode("missing version".to_string()))?
        as i32;

    let mut tracker = ObjectGraphTracker::new();
    let yielded = decode_value(
        root.get("yielded").unwrap_or(&Json::Null),
        &mut tracker,
    )?;

    let stack = match root.get("stack") {
        Some(Json::Array(frames)) => frames.as_slice(),
        Some(Json::Null) | None => &[],
        Some(_) => return Err(StateError::Decode("stack is not a list".to_string())),
    };

    // First pass: materialize records; second pass: wire caller links, so
    // forward references and cycles rebuild as shared handles.
    let mut records: Vec<FrameRef> = Vec::with_capacity(stack.len());
    let mut callers: Vec<Option<usize>> = Vec::with_capacity(stack.len());
    for frame in stack {
        let method_token = field_i64(frame, "method_token")? as i32;
        let yield_point_id = field_i64(frame, "yield_point_id")? as i32;
        let mut slots = Vec::new();
        if let Some(Json::Array(raw)) = frame.get("slots") {
            for slot in raw {
                slots.push(decode_value(slot, &mut tracker)?);
            }
        }
        callers.push(match frame.get("caller") {
            Some(Json::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                StateError::Decode("caller fid is not an index".to_string())
            })? as usize),
            _ => None,
        });
        records.push(FrameRecord::new(method_token, yield_point_id, slots, None));
    }
    for (record, caller) in records.iter().zip(&callers) {
        if let Some(fid) = caller {
            let target = records
                .get(*fid)
                .ok_or_else(|| StateError::Decode(format!("caller fid {fid} out of range")))?;
            record.borrow_mut().caller = Some(Rc::clone(target));
        }
    }

    Ok(ContinuationState {
        version,
        stack_head: records.first().cloned(),
        yielded_value: yielded,
    })
}

fn field_i64(frame: &Json, name: &str) -> Result<i64, StateError> {
    frame
        .get(name)
        .and_then(Json::as_i64)
        .ok_or_else(|| StateError::Decode(format!("missing frame field `{name}`")))
}

fn encode_value(value: &Value, tracker: &mut ObjectGraphTracker) -> Result<Json, StateError> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(v) => json!({"t": "bool", "v": v}),
        Value::I32(v) => json!({"t": "i32", "v": v}),
        // Strings keep 64-bit precision out of JSON number territory.
        Value::I64(v) => json!({"t": "i64", "v": v.to_string()}),
        Value::F64(v) => {
            if !v.is_finite() {
                return Err(StateError::Encode(format!(
                    "non-finite number {v} is not encodable"
                )));
            }
            json!({"t": "f64", "v": v})
        }
        Value::Char(v) => json!({"t": "char", "v": v.to_string()}),
        Value::Str(s) => {
            let (is_new, id) = tracker.try_register(value);
            if is_new {
                json!({"t": "str", "id": id, "v": **s})
            } else {
                json!({"ref": id})
            }
        }
        Value::Array(array) => {
            let (is_new, id) = tracker.try_register(value);
            if is_new {
                let borrowed = array.borrow();
                let elem = serde_json::to_value(&borrowed.elem)
                    .map_err(|e| StateError::Encode(e.to_string()))?;
                let mut items = Vec::with_capacity(borrowed.items.len());
                for item in &borrowed.items {
                    items.push(encode_value(item, tracker)?);
                }
                json!({"t": "arr", "id": id, "elem": elem, "items": items})
            } else {
                json!({"ref": id})
            }
        }
        Value::Frame(_) | Value::Signal(_) => {
            return Err(StateError::Encode(format!(
                "reserved runtime type `{}` is not encodable",
                value.kind_name()
            )))
        }
    })
}

fn decode_value(json: &Json, tracker: &mut ObjectGraphTracker) -> Result<Value, StateError> {
    let object: &Map<String, Json> = match json {
        Json::Null => return Ok(Value::Null),
        Json::Object(object) => object,
        other => return Err(StateError::Decode(format!("unexpected value {other}"))),
    };

    if let Some(id) = object.get("ref").and_then(Json::as_i64) {
        return tracker
            .get_by_id(id as i32)
            .ok_or_else(|| StateError::Decode(format!("dangling reference id {id}")));
    }

    let tag = object
        .get("t")
        .and_then(Json::as_str)
        .ok_or_else(|| StateError::Decode("value carries no type tag".to_string()))?;
    let v = object.get("v");
    match tag {
        "bool" => Ok(Value::Bool(
            v.and_then(Json::as_bool)
                .ok_or_else(|| StateError::Decode("bool payload".to_string()))?,
        )),
        "i32" => Ok(Value::I32(
            v.and_then(Json::as_i64)
                .ok_or_else(|| StateError::Decode("i32 payload".to_string()))? as i32,
        )),
        "i64" => {
            let raw = v
                .and_then(Json::as_str)
                .ok_or_else(|| StateError::Decode("i64 payload".to_string()))?;
            raw.parse()
                .map(Value::I64)
                .map_err(|_| StateError::Decode(format!("malformed i64 `{raw}`")))
        }
        "f64" => Ok(Value::F64(
            v.and_then(Json::as_f64)
                .ok_or_else(|| StateError::Decode("f64 payload".to_string()))?,
        )),
        "char" => {
            let raw = v
                .and_then(Json::as_str)
                .ok_or_else(|| StateError::Decode("char payload".to_string()))?;
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Char(c)),
                _ => Err(StateError::Decode(format!("malformed char `{raw}`"))),
            }
        }
        "str" => {
            let id = object
                .get("id")
                .and_then(Json::as_i64)
                .ok_or_else(|| StateError::Decode("string without id".to_string()))?;
            let raw = v
                .and_then(Json::as_str)
                .ok_or_else(|| StateError::Decode("str payload".to_string()))?;
            let value = Value::str(raw);
            tracker.register_deserialized(id as i32, value.clone())?;
            Ok(value)
        }
        "arr" => {
            let id = object
                .get("id")
                .and_then(Json::as_i64)
                .ok_or_else(|| StateError::Decode("array without id".to_string()))?;
            let elem: TypeSig = serde_json::from_value(
                object.get("elem").cloned().unwrap_or(Json::Null),
            )
            .map_err(|e| StateError::Decode(e.to_string()))?;
            // Bind before decoding items so self-references resolve.
            let value = Value::array(elem, Vec::new());
            tracker.register_deserialized(id as i32, value.clone())?;
            if let Some(Json::Array(raw)) = object.get("items") {
                let Value::Array(array) = &value else {
                    unreachable!()
                };
                for item in raw {
                    let decoded = decode_value(item, tracker)?;
                    array.borrow_mut().items.push(decoded);
                }
            }
            Ok(value)
        }
        other => Err(StateError::Decode(format!("unknown value tag `{other}`"))),
    }
}
