use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    SchoolHead,
    Teacher,
    ClassHead,
    Student,
    Parent,
    StoreHouse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ImportDirectory,
    ManageAssessmentTypes,
    RecordMarks,
    CompileResults,
    PublishResults,
    SendRoster,
    ViewOwnReport,
    ViewChildReport,
    ViewRosters,
    ViewNotifications,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "admin" => Some(Role::Admin),
            "school_head" => Some(Role::SchoolHead),
            "teacher" => Some(Role::Teacher),
            "class_head" => Some(Role::ClassHead),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            "store_house" => Some(Role::StoreHouse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::SchoolHead => "school_head",
            Role::Teacher => "teacher",
            Role::ClassHead => "class_head",
            Role::Student => "student",
            Role::Parent => "parent",
            Role::StoreHouse => "store_house",
        }
    }

    pub fn can(self, cap: Capability) -> bool {
        use Capability::*;
        match self {
            Role::Admin => matches!(cap, ImportDirectory | ManageAssessmentTypes | ViewNotifications),
            Role::SchoolHead => matches!(cap, ManageAssessmentTypes | ViewNotifications),
            // A class head is also a teacher of their own subjects.
            Role::ClassHead => matches!(
                cap,
                RecordMarks | CompileResults | PublishResults | SendRoster | ViewNotifications
            ),
            Role::Teacher => matches!(cap, RecordMarks | ViewNotifications),
            Role::Student => matches!(cap, ViewOwnReport | ViewNotifications),
            Role::Parent => matches!(cap, ViewChildReport | ViewNotifications),
            Role::StoreHouse => matches!(cap, ViewRosters | ViewNotifications),
        }
    }
}

/// The caller as claimed by the transport. Not authenticated here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub role: Role,
    pub user_id: String,
}

impl Actor {
    pub fn from_params(params: &serde_json::Value) -> AppResult<Self> {
        let Some(actor) = params.get("actor").and_then(|v| v.as_object()) else {
            return Err(AppError::validation("missing actor"));
        };
        let role_raw = actor
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::validation("missing actor.role"))?;
        let role = Role::parse(role_raw).ok_or_else(|| {
            AppError::validation(format!("unknown actor.role: {role_raw}"))
        })?;
        let user_id = match actor.get("user_id") {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(AppError::validation("missing actor.user_id")),
        };
        Ok(Actor { role, user_id })
    }

    pub fn require(&self, cap: Capability) -> AppResult<()> {
        if self.role.can(cap) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!(
                "role {} is not allowed to perform this action",
                self.role.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_class_heads_compile_and_publish() {
        for role in [
            Role::Admin,
            Role::SchoolHead,
            Role::Teacher,
            Role::Student,
            Role::Parent,
            Role::StoreHouse,
        ] {
            assert!(!role.can(Capability::CompileResults), "{role:?}");
            assert!(!role.can(Capability::PublishResults), "{role:?}");
        }
        assert!(Role::ClassHead.can(Capability::CompileResults));
        assert!(Role::ClassHead.can(Capability::SendRoster));
    }

    #[test]
    fn actor_parses_numeric_user_ids_and_dashed_roles() {
        let actor = Actor::from_params(&json!({
            "actor": { "role": "store-house", "user_id": 12 }
        }))
        .expect("actor");
        assert_eq!(actor.role, Role::StoreHouse);
        assert_eq!(actor.user_id, "12");
    }

    #[test]
    fn missing_actor_is_a_validation_error() {
        let e = Actor::from_params(&json!({})).unwrap_err();
        assert_eq!(e.code(), crate::error::ErrorCode::ValidationError);
        let e = Actor::from_params(&json!({ "actor": { "role": "janitor", "user_id": "1" } }))
            .unwrap_err();
        assert_eq!(e.code(), crate::error::ErrorCode::ValidationError);
    }
}
