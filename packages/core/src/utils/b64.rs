// Base64 утилиты

use base64::{engine::general_purpose, Engine};

pub fn encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

pub fn decode(data: &str) -> Result<Vec<u8>, String> {
    general_purpose::STANDARD
        .decode(data)
        .map_err(|e| format!("Base64 decode failed: {}", e))
}

/// Собрать data URL (`data:<mime>;base64,<payload>`) для inline-передачи
pub fn to_data_url(mime: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime, encode(data))
}

/// Разобрать data URL обратно в (mime, bytes)
pub fn from_data_url(url: &str) -> Result<(String, Vec<u8>), String> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| "Not a data URL".to_string())?;
    let (mime, payload) = rest
        .split_once(";base64,")
        .ok_or_else(|| "Data URL is not base64 encoded".to_string())?;
    Ok((mime.to_string(), decode(payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url() {
        let url = to_data_url("image/png", &[1, 2, 3]);
        assert_eq!(url, "data:image/png;base64,AQID");

        let (mime, bytes) = from_data_url(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_plain_url() {
        assert!(from_data_url("https://cdn.example/a.png").is_err());
    }
}
