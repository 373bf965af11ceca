use std::time::Duration;

use moka::sync::Cache;

use crate::entities::User;

/// 认证用的用户缓存，按 API 密钥与用户标识两种方式索引
///
/// 缓存命中只作为快捷路径；认证失败时调用方必须先失效再回源存储。
#[derive(Clone)]
pub struct UserCache {
    by_id: Cache<String, User>,
    by_api_key: Cache<String, String>,
}

impl UserCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            by_id: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            by_api_key: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, id: &str) -> Option<User> {
        self.by_id.get(id)
    }

    pub fn get_by_api_key(&self, api_key: &str) -> Option<User> {
        let id = self.by_api_key.get(api_key)?;
        self.by_id.get(&id)
    }

    pub fn insert(&self, user: &User) {
        if !user.api_key.is_empty() {
            self.by_api_key.insert(user.api_key.clone(), user.id.clone());
        }
        self.by_id.insert(user.id.clone(), user.clone());
    }

    /// 失效某个用户及其密钥索引
    pub fn invalidate(&self, id: &str) {
        if let Some(user) = self.by_id.get(id) {
            if !user.api_key.is_empty() {
                self.by_api_key.invalidate(&user.api_key);
            }
        }
        self.by_id.invalidate(id);
    }

    pub fn invalidate_api_key(&self, api_key: &str) {
        if let Some(id) = self.by_api_key.get(api_key) {
            self.by_id.invalidate(&id);
        }
        self.by_api_key.invalidate(api_key);
    }
}

impl Default for UserCache {
    fn default() -> Self {
        Self::new(1024, Duration::from_secs(300))
    }
}
