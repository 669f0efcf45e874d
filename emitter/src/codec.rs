use crate::transport::EmitResult;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_EXCHANGE: &str = "";

/// Full channel name for `event` within `exchange`.
pub fn topic(exchange: &str, event: &str) -> String {
    format!("{}/{}", exchange, event)
}

pub fn encode<T: Serialize + ?Sized>(message: &T) -> EmitResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode(payload: &[u8]) -> EmitResult<Value> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::EmitError;
    use serde_json::json;

    #[test]
    fn test_topic() {
        assert_eq!(topic(DEFAULT_EXCHANGE, "echo"), "/echo");
        assert_eq!(topic("orders", "created"), "orders/created");
    }

    #[test]
    fn test_encode_decode() {
        let payload = encode(&json!({"msg": "in-process", "n": 3})).unwrap();
        let value = decode(&payload).unwrap();
        assert_eq!(value["msg"], "in-process");
        assert_eq!(value["n"], 3);

        let empty: Option<()> = None;
        assert_eq!(decode(&encode(&empty).unwrap()).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(b"\x80\x04not json"),
            Err(EmitError::Serialization(_))
        ));
    }
}
