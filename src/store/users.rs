use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Users {
    pool: SqlitePool,
}

impl Users {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers a user. Emails are unique.
    pub async fn add(&self, email: &str, display_name: &str) -> Result<User> {
        const SQL: &str = "\
INSERT INTO users (email, display_name, created_at)
VALUES (?, ?, ?)
RETURNING id, email, display_name, created_at;
";

        let user = sqlx::query_as(SQL)
            .bind(email)
            .bind(display_name)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        Ok(user)
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>> {
        const SQL: &str = "\
SELECT id, email, display_name, created_at
FROM users
WHERE id = ?;
";

        let user = sqlx::query_as(SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }

    /// Lists all users ordered by email.
    pub async fn list(&self) -> Result<Vec<User>> {
        const SQL: &str = "\
SELECT id, email, display_name, created_at
FROM users
ORDER BY email ASC;
";

        let users = sqlx::query_as(SQL).fetch_all(&self.pool).await?;
        Ok(users)
    }
}
