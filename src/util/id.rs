use uuid::Uuid;

/// 日志 span 中使用的请求编号。
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = request_id();
        let b = request_id();
        assert!(a.starts_with("req-"));
        assert_eq!(a.len(), "req-".len() + 32);
        assert_ne!(a, b);
    }
}
