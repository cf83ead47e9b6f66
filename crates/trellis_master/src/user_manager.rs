//! User catalog and token verification.

use std::collections::BTreeMap;
use std::sync::Mutex;

use trellis_proto::messages::{UserInfo, UserOperateType};
use trellis_proto::status::StatusCode;

pub const ROOT_USER: &str = "root";

#[derive(Default)]
pub struct UserManager {
    users: Mutex<BTreeMap<String, UserInfo>>,
}

impl UserManager {
    pub fn new(root_token: impl Into<String>) -> Self {
        let manager = Self::default();
        manager.users.lock().unwrap().insert(
            ROOT_USER.to_string(),
            UserInfo {
                user_name: ROOT_USER.to_string(),
                token: root_token.into(),
                group_names: Vec::new(),
            },
        );
        manager
    }

    pub fn is_root_token(&self, token: &str) -> bool {
        self.users
            .lock()
            .unwrap()
            .get(ROOT_USER)
            .map(|root| root.token == token)
            .unwrap_or(false)
    }

    pub fn user_for_token(&self, token: &str) -> Option<UserInfo> {
        self.users
            .lock()
            .unwrap()
            .values()
            .find(|user| user.token == token)
            .cloned()
    }

    pub fn find(&self, user_name: &str) -> Option<UserInfo> {
        self.users.lock().unwrap().get(user_name).cloned()
    }

    /// Apply one user operation. Only root may mutate the catalog; anyone
    /// may show their own user.
    pub fn operate(
        &self,
        op: UserOperateType,
        info: UserInfo,
        caller_token: &str,
    ) -> Result<Option<UserInfo>, StatusCode> {
        let is_root = self.is_root_token(caller_token);
        if !is_root && op != UserOperateType::ShowUser {
            return Err(StatusCode::NotPermission);
        }
        let mut users = self.users.lock().unwrap();
        match op {
            UserOperateType::CreateUser => {
                if info.user_name.is_empty() || users.contains_key(&info.user_name) {
                    return Err(StatusCode::InvalidArgument);
                }
                users.insert(info.user_name.clone(), info);
                Ok(None)
            }
            UserOperateType::DeleteUser => {
                if info.user_name == ROOT_USER {
                    return Err(StatusCode::InvalidArgument);
                }
                users
                    .remove(&info.user_name)
                    .map(|_| None)
                    .ok_or(StatusCode::InvalidArgument)
            }
            UserOperateType::ChangePwd => {
                let user = users
                    .get_mut(&info.user_name)
                    .ok_or(StatusCode::InvalidArgument)?;
                user.token = info.token;
                Ok(None)
            }
            UserOperateType::ShowUser => {
                let user = users
                    .get(&info.user_name)
                    .ok_or(StatusCode::InvalidArgument)?;
                if !is_root && user.token != caller_token {
                    return Err(StatusCode::NotPermission);
                }
                Ok(Some(user.clone()))
            }
            UserOperateType::AddToGroup => {
                let user = users
                    .get_mut(&info.user_name)
                    .ok_or(StatusCode::InvalidArgument)?;
                for group in info.group_names {
                    if !user.group_names.contains(&group) {
                        user.group_names.push(group);
                    }
                }
                Ok(None)
            }
            UserOperateType::DeleteFromGroup => {
                let user = users
                    .get_mut(&info.user_name)
                    .ok_or(StatusCode::InvalidArgument)?;
                user.group_names
                    .retain(|group| !info.group_names.contains(group));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, token: &str) -> UserInfo {
        UserInfo {
            user_name: name.to_string(),
            token: token.to_string(),
            group_names: Vec::new(),
        }
    }

    #[test]
    fn only_root_mutates_users() {
        let manager = UserManager::new("root-token");
        assert_eq!(
            manager
                .operate(UserOperateType::CreateUser, user("alice", "t1"), "bogus")
                .err(),
            Some(StatusCode::NotPermission)
        );
        manager
            .operate(UserOperateType::CreateUser, user("alice", "t1"), "root-token")
            .unwrap();
        assert!(manager.find("alice").is_some());

        // Alice can show herself but not delete herself.
        assert!(manager
            .operate(UserOperateType::ShowUser, user("alice", ""), "t1")
            .unwrap()
            .is_some());
        assert_eq!(
            manager
                .operate(UserOperateType::DeleteUser, user("alice", ""), "t1")
                .err(),
            Some(StatusCode::NotPermission)
        );
    }

    #[test]
    fn group_membership_round_trips() {
        let manager = UserManager::new("root-token");
        manager
            .operate(UserOperateType::CreateUser, user("bob", "t2"), "root-token")
            .unwrap();
        let mut grouped = user("bob", "");
        grouped.group_names = vec!["writers".to_string()];
        manager
            .operate(UserOperateType::AddToGroup, grouped.clone(), "root-token")
            .unwrap();
        assert_eq!(manager.find("bob").unwrap().group_names, vec!["writers"]);
        manager
            .operate(UserOperateType::DeleteFromGroup, grouped, "root-token")
            .unwrap();
        assert!(manager.find("bob").unwrap().group_names.is_empty());
    }
}
