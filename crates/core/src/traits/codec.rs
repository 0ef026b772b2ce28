use serde::{de::DeserializeOwned, Serialize};

use crate::{QueueError, QueueResult};

/// 任务负载编解码器，构造时注入，对负载类型多态
pub trait PayloadCodec<T>: Send + Sync {
    fn serialize(&self, payload: &T) -> QueueResult<String>;

    fn deserialize(&self, raw: &str) -> QueueResult<T>;
}

/// 默认的JSON编解码器
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> PayloadCodec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, payload: &T) -> QueueResult<String> {
        serde_json::to_string(payload).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn deserialize(&self, raw: &str) -> QueueResult<T> {
        serde_json::from_str(raw).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let raw = codec
            .serialize(&Email {
                to: "a@b.c".into(),
            })
            .unwrap();
        let decoded: Email = codec.deserialize(&raw).unwrap();
        assert_eq!(decoded.to, "a@b.c");
        let bad: QueueResult<Email> = codec.deserialize("{");
        assert!(matches!(bad, Err(QueueError::Serialization(_))));
    }
}
