use crate::db;
use crate::error::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Teacher,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            _ => None,
        }
    }
}

/// The user a request runs on behalf of.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub role: Role,
    pub subject: Option<String>,
}

impl Actor {
    /// The operator of the desktop install; used when a request names no
    /// actor.
    pub fn local_admin() -> Self {
        Self {
            user_id: None,
            username: None,
            role: Role::Admin,
            subject: None,
        }
    }

    /// A known user id takes its role and subject from the directory. Without
    /// a user id only the administrator role is accepted, since a teacher's
    /// scope is their own id.
    pub fn resolve(conn: &Connection, user_id: Option<&str>, role: Option<&str>) -> AppResult<Self> {
        if let Some(id) = user_id {
            let user = get(conn, id).map_err(|e| match e {
                AppError::NotFound { .. } => AppError::forbidden("unknown actor"),
                other => other,
            })?;
            return Ok(Self {
                user_id: Some(user.id),
                username: Some(user.username),
                role: user.role,
                subject: user.subject,
            });
        }
        match role {
            None => Ok(Self::local_admin()),
            Some(r) => {
                let role = Role::parse(r)
                    .ok_or_else(|| AppError::validation(format!("unknown role: {r}")))?;
                if role == Role::Teacher {
                    return Err(AppError::forbidden("a teacher actor must give its userId"));
                }
                Ok(Self::local_admin())
            }
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self, action: &str) -> AppResult<()> {
        if self.is_admin() {
            return Ok(());
        }
        Err(AppError::forbidden(format!("only administrators can {action}")))
    }

    /// Admins, or the teacher whose id is `owner`.
    pub fn require_owner_or_admin(&self, owner: Option<&str>, action: &str) -> AppResult<()> {
        if self.is_admin() {
            return Ok(());
        }
        match (self.user_id.as_deref(), owner) {
            (Some(me), Some(owner)) if me == owner => Ok(()),
            _ => Err(AppError::forbidden(format!(
                "you can only {action} records you own"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub subject: Option<String>,
    pub classes: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPatch {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub subject: Option<String>,
    pub classes: Option<Vec<String>>,
}

const USER_COLUMNS: &str = "id, username, role, subject, classes_json, created_at";

fn user_from_row(r: &Row<'_>) -> rusqlite::Result<User> {
    let role: String = r.get(2)?;
    Ok(User {
        id: r.get(0)?,
        username: r.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Teacher),
        subject: r.get(3)?,
        classes: db::json_list(r.get(4)?),
        created_at: r.get(5)?,
    })
}

pub fn list(conn: &Connection) -> AppResult<Vec<User>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY username"
    ))?;
    let users = stmt
        .query_map([], user_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

pub fn get(conn: &Connection, id: &str) -> AppResult<User> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"),
        [id],
        user_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("user", id))
}

fn username_taken(conn: &Connection, username: &str, except: Option<&str>) -> AppResult<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?",
            [username],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match found {
        Some(id) => Some(id.as_str()) != except,
        None => false,
    })
}

fn clean_subject(subject: Option<String>) -> Option<String> {
    subject
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn create(conn: &Connection, actor: &Actor, input: NewUser) -> AppResult<User> {
    actor.require_admin("manage users")?;
    let username = input.username.trim().to_string();
    if username.is_empty() {
        return Err(AppError::validation("username must not be empty"));
    }
    if username_taken(conn, &username, None)? {
        return Err(AppError::validation("username already exists"));
    }

    let user = User {
        id: db::new_id(),
        username,
        role: input.role,
        subject: clean_subject(input.subject),
        classes: input.classes,
        created_at: db::now_timestamp(),
    };
    conn.execute(
        "INSERT INTO users(id, username, role, subject, classes_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &user.id,
            &user.username,
            user.role.as_str(),
            &user.subject,
            serde_json::to_string(&user.classes).unwrap_or_else(|_| "[]".to_string()),
            &user.created_at,
        ),
    )?;
    tracing::info!(user_id = %user.id, username = %user.username, role = user.role.as_str(), "user created");
    Ok(user)
}

pub fn update(conn: &Connection, actor: &Actor, id: &str, patch: UserPatch) -> AppResult<User> {
    actor.require_admin("manage users")?;
    let mut user = get(conn, id)?;

    if let Some(username) = patch.username {
        let username = username.trim().to_string();
        if username.is_empty() {
            return Err(AppError::validation("username must not be empty"));
        }
        if username_taken(conn, &username, Some(id))? {
            return Err(AppError::validation("username already exists"));
        }
        user.username = username;
    }
    if let Some(role) = patch.role {
        user.role = role;
    }
    if patch.subject.is_some() {
        user.subject = clean_subject(patch.subject);
    }
    if let Some(classes) = patch.classes {
        user.classes = classes;
    }

    conn.execute(
        "UPDATE users SET username = ?, role = ?, subject = ?, classes_json = ? WHERE id = ?",
        (
            &user.username,
            user.role.as_str(),
            &user.subject,
            serde_json::to_string(&user.classes).unwrap_or_else(|_| "[]".to_string()),
            id,
        ),
    )?;
    Ok(user)
}

/// Removes a user. Their assessments stay but lose the owner link.
pub fn delete(conn: &Connection, actor: &Actor, id: &str) -> AppResult<()> {
    actor.require_admin("manage users")?;
    if actor.user_id.as_deref() == Some(id) {
        return Err(AppError::validation("you cannot delete your own account"));
    }
    get(conn, id)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE assessments SET teacher_id = NULL WHERE teacher_id = ?",
        [id],
    )?;
    tx.execute("DELETE FROM users WHERE id = ?", [id])?;
    tx.commit()?;
    tracing::info!(user_id = id, "user deleted");
    Ok(())
}
