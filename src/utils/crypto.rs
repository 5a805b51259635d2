//! Криптографические утилиты для активации устройства

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Алгоритм, который консоль ждет в запросе активации по умолчанию
pub const ACTIVATION_ALGORITHM: &str = "hmac_sha256";

/// Вычисляет HMAC-SHA256 и возвращает его в hex (нижний регистр)
pub fn compute_hmac(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_hmac(key: &[u8], message: &[u8], signature: &str) -> bool {
    compute_hmac(key, message).eq_ignore_ascii_case(signature.trim())
}

/// Случайный challenge из 32 байт в hex
pub fn generate_challenge() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Строка, которую консоль подписывает при проверке активации
pub fn activation_message(algorithm: &str, serial_number: &str, challenge: &str) -> String {
    format!("{}{}{}", algorithm, serial_number, challenge)
}

/// Тело запроса активации, которое ожидает консоль
pub fn activation_request(serial_number: &str, challenge: &str, response: &str) -> serde_json::Value {
    serde_json::json!({
        "serial_number": serial_number,
        "challenge": challenge,
        "response": response,
    })
}
