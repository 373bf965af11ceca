use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use trellis_errors::{ErrorKind, TrellisError, TrellisResult};

use crate::entities::{User, UserStatus, RESERVED_USER_IDS, ROOT_USER};
use crate::patches::{parse_patch, UserPatch};
use crate::query::{Filter, Identity, ListQuery, Page, SortSpec};
use crate::repositories::DocumentUpdate;
use crate::services::repository::Repository;
use crate::services::user_cache::UserCache;
use crate::services::{is_valid_name, update_with_retry};

/// 认证凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    Password { user_id: String, password_hash: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub id: String,
    pub name: String,
    /// 已哈希的口令
    pub password_hash: String,
}

#[derive(Clone)]
pub struct UserService {
    users: Repository<User>,
    cache: UserCache,
}

impl UserService {
    pub fn new(users: Repository<User>, cache: UserCache) -> Self {
        Self { users, cache }
    }

    /// 确保 root 用户存在且持有 API 密钥
    pub async fn bootstrap_root(&self) -> TrellisResult<User> {
        let root = Identity::root();
        if self.users.find_versioned(&root, ROOT_USER).await?.is_none() {
            let user = User {
                id: ROOT_USER.to_string(),
                name: "Root".to_string(),
                status: UserStatus::Active,
                password_hash: String::new(),
                api_key: String::new(),
            };
            match self.users.insert(&user).await {
                Ok(_) => info!("已创建 root 用户"),
                Err(e) if e.kind() == ErrorKind::IdentifierTaken => {
                    debug!("root 用户已由其他进程创建");
                }
                Err(e) => return Err(e),
            }
        }
        self.login(&root).await
    }

    pub async fn create(&self, identity: &Identity, new: NewUser) -> TrellisResult<User> {
        if !identity.is_root() {
            return Err(TrellisError::unauthorized("只有 root 可以创建用户"));
        }
        if RESERVED_USER_IDS.contains(&new.id.as_str()) {
            return Err(TrellisError::bad_input(format!("用户标识 {} 为保留标识", new.id)));
        }
        if !is_valid_name(&new.id) {
            return Err(TrellisError::bad_input(format!(
                "用户标识 {} 只能包含字母、数字、下划线和连字符",
                new.id
            )));
        }
        if new.password_hash.is_empty() {
            return Err(TrellisError::bad_input("口令不能为空"));
        }

        let user = User {
            id: new.id,
            name: new.name,
            status: UserStatus::Active,
            password_hash: new.password_hash,
            api_key: String::new(),
        };
        let created = self.users.insert(&user).await?.value;
        info!(user_id = %created.id, "创建用户");
        Ok(created)
    }

    pub async fn get(&self, identity: &Identity, id: &str) -> TrellisResult<User> {
        self.users.get(identity, id).await
    }

    pub async fn list(&self, identity: &Identity, query: &ListQuery) -> TrellisResult<Page<User>> {
        self.users.list(identity, query, vec![], None).await
    }

    pub async fn update(&self, identity: &Identity, id: &str, patch: UserPatch) -> TrellisResult<User> {
        if patch.password.as_deref() == Some("") {
            return Err(TrellisError::bad_input("口令不能为空"));
        }
        if id == ROOT_USER && patch.status == Some(UserStatus::Archived) {
            return Err(TrellisError::bad_input("root 用户不能归档"));
        }

        let (updated, _) = update_with_retry(&self.users, identity, id, |_| {
            let mut update = DocumentUpdate::new();
            if let Some(name) = &patch.name {
                update = update.set("name", name.as_str());
            }
            if let Some(status) = patch.status {
                update = update.set("status", status.as_str());
            }
            if let Some(password) = &patch.password {
                update = update.set("password-hash", password.as_str());
            }
            Ok(update)
        })
        .await?;

        self.cache.invalidate(id);
        Ok(updated)
    }

    pub async fn update_fields(
        &self,
        identity: &Identity,
        id: &str,
        fields: Map<String, Value>,
    ) -> TrellisResult<User> {
        self.update(identity, id, parse_patch(fields)?).await
    }

    /// 认证调用者
    ///
    /// 缓存命中且凭据一致时直接返回；否则失效缓存并回源存储。凭据错误返回 `Unauthorized`。
    pub async fn authenticate(&self, credentials: &Credentials) -> TrellisResult<User> {
        let user = match credentials {
            Credentials::ApiKey(api_key) => self.authenticate_api_key(api_key).await?,
            Credentials::Password {
                user_id,
                password_hash,
            } => self.authenticate_password(user_id, password_hash).await?,
        };

        if user.status != UserStatus::Active {
            self.cache.invalidate(&user.id);
            return Err(TrellisError::unauthorized(format!("用户 {} 已归档", user.id)));
        }
        Ok(user)
    }

    async fn authenticate_api_key(&self, api_key: &str) -> TrellisResult<User> {
        if api_key.is_empty() {
            return Err(TrellisError::unauthorized("API 密钥为空"));
        }
        if let Some(user) = self.cache.get_by_api_key(api_key) {
            if user.api_key == api_key {
                return Ok(user);
            }
        }
        self.cache.invalidate_api_key(api_key);

        let found = self
            .users
            .find_all(
                &Identity::root(),
                vec![Filter::eq("api-key", api_key)],
                SortSpec::default(),
            )
            .await?;
        match found.into_iter().next() {
            Some(user) => {
                self.cache.insert(&user);
                Ok(user)
            }
            None => {
                warn!("API 密钥认证失败");
                Err(TrellisError::unauthorized("API 密钥无效"))
            }
        }
    }

    async fn authenticate_password(&self, user_id: &str, password_hash: &str) -> TrellisResult<User> {
        if user_id == ROOT_USER {
            return Err(TrellisError::unauthorized("root 用户只能使用 API 密钥认证"));
        }
        if password_hash.is_empty() {
            return Err(TrellisError::unauthorized("口令为空"));
        }
        if let Some(user) = self.cache.get(user_id) {
            if user.password_hash == password_hash {
                return Ok(user);
            }
        }
        self.cache.invalidate(user_id);

        match self.users.find_versioned(&Identity::root(), user_id).await? {
            Some(found) if found.value.password_hash == password_hash => {
                self.cache.insert(&found.value);
                Ok(found.value)
            }
            _ => {
                warn!(user_id, "口令认证失败");
                Err(TrellisError::unauthorized("用户名或口令错误"))
            }
        }
    }

    /// 为调用者生成 API 密钥，已有密钥时原样返回
    pub async fn login(&self, identity: &Identity) -> TrellisResult<User> {
        let root = Identity::root();
        let current = self.users.get(&root, identity.user_id()).await?;
        if !current.api_key.is_empty() {
            self.cache.insert(&current);
            return Ok(current);
        }

        let api_key = uuid::Uuid::new_v4().simple().to_string();
        let issued = self
            .users
            .update_first(
                &root,
                vec![Filter::eq("id", current.id.as_str()), Filter::eq("api-key", "")],
                &SortSpec::default(),
                &DocumentUpdate::new().set("api-key", api_key),
            )
            .await?;

        let user = match issued {
            Some(versioned) => {
                info!(user_id = %current.id, "签发 API 密钥");
                versioned.value
            }
            // 并发登录时沿用先写入的密钥
            None => self.users.get(&root, &current.id).await?,
        };
        self.cache.insert(&user);
        Ok(user)
    }

    /// 清除调用者的 API 密钥
    pub async fn logout(&self, identity: &Identity) -> TrellisResult<User> {
        let root = Identity::root();
        let current = self.users.get(&root, identity.user_id()).await?;
        self.cache.invalidate(&current.id);
        if !current.api_key.is_empty() {
            self.cache.invalidate_api_key(&current.api_key);
        }

        let (user, _) = update_with_retry(&self.users, &root, &current.id, |user| {
            Ok(if user.api_key.is_empty() {
                DocumentUpdate::new()
            } else {
                DocumentUpdate::new().set("api-key", "")
            })
        })
        .await?;
        info!(user_id = %user.id, "注销 API 密钥");
        Ok(user)
    }
}
