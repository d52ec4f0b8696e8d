use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are `resource:action` strings (e.g. "image:upload"). The action
/// part decides how sensitive the permission is, see [`PermissionClass`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const IMAGE_UPLOAD: Permission = Permission(Cow::Borrowed("image:upload"));
    pub const IMAGE_READ: Permission = Permission(Cow::Borrowed("image:read"));
    pub const IMAGE_DELETE: Permission = Permission(Cow::Borrowed("image:delete"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the first `:`, if any.
    pub fn action(&self) -> Option<&str> {
        self.as_str().split_once(':').map(|(_, action)| action)
    }

    pub fn class(&self) -> PermissionClass {
        PermissionClass::of(self)
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Permission {
    fn from(value: &'static str) -> Self {
        Self::new(value)
    }
}

/// Sensitivity class of a permission; selects the cache TTL of allowed
/// decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionClass {
    Read,
    Write,
    Admin,
}

impl PermissionClass {
    /// Classify by action: `read|list|view|get` are reads,
    /// `admin|delete|purge` are admin, everything else (including permissions
    /// without an action) is a write.
    pub fn of(permission: &Permission) -> Self {
        let Some(action) = permission.action() else {
            return Self::Write;
        };

        match action.to_ascii_lowercase().as_str() {
            "read" | "list" | "view" | "get" => Self::Read,
            "admin" | "delete" | "purge" => Self::Admin,
            _ => Self::Write,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn classifies_by_action() {
        assert_eq!(Permission::IMAGE_READ.class(), PermissionClass::Read);
        assert_eq!(Permission::new("image:LIST").class(), PermissionClass::Read);
        assert_eq!(Permission::IMAGE_UPLOAD.class(), PermissionClass::Write);
        assert_eq!(Permission::IMAGE_DELETE.class(), PermissionClass::Admin);
        assert_eq!(Permission::new("org:purge").class(), PermissionClass::Admin);
        assert_eq!(Permission::new("superuser").class(), PermissionClass::Write);
    }

    #[test]
    fn action_splits_on_first_colon_only() {
        assert_eq!(Permission::new("a:b:c").action(), Some("b:c"));
        assert_eq!(Permission::new("a:b:c").class(), PermissionClass::Write);
    }

    proptest! {
        #[test]
        fn unknown_actions_default_to_write(resource in "[a-z]{1,8}", action in "[a-z]{1,10}") {
            prop_assume!(!matches!(
                action.as_str(),
                "read" | "list" | "view" | "get" | "admin" | "delete" | "purge"
            ));
            let permission = Permission::new(format!("{resource}:{action}"));
            prop_assert_eq!(permission.class(), PermissionClass::Write);
        }
    }
}
