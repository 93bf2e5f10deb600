use argon2::{
    Argon2, PasswordVerifier,
    password_hash::{PasswordHash, PasswordHasher, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    config::GamificationConfig,
    error::{Error, Result},
    gamification::{Rank, level_for},
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StudentInfo {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub rank: Rank,
    pub experience: i64,
    pub level: i64,
    pub gems: i64,
}

#[derive(sqlx::FromRow)]
struct StudentRow {
    id: i64,
    name: String,
    email: String,
    rank: i64,
    experience: i64,
    gems: i64,
}

impl StudentRow {
    fn into_info(self, config: &GamificationConfig) -> Result<StudentInfo> {
        Ok(StudentInfo {
            id: self.id,
            name: self.name,
            email: self.email,
            rank: Rank::try_from(self.rank)?,
            experience: self.experience,
            level: level_for(config, self.experience),
            gems: self.gems,
        })
    }
}

const COLUMNS: &str = "id, name, email, rank, experience, gems";

pub async fn get_student_list(
    database: &SqlitePool,
    config: &GamificationConfig,
) -> Result<Vec<StudentInfo>> {
    sqlx::query_as::<_, StudentRow>(&format!("select {COLUMNS} from student order by id"))
        .fetch_all(database)
        .await?
        .into_iter()
        .map(|row| row.into_info(config))
        .collect()
}

pub async fn get_student_info(
    database: &SqlitePool,
    config: &GamificationConfig,
    id: i64,
) -> Result<StudentInfo> {
    sqlx::query_as::<_, StudentRow>(&format!("select {COLUMNS} from student where id = ?"))
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| Error::NotFound(format!("student {id}")))?
        .into_info(config)
}

pub async fn create_student(
    database: &SqlitePool,
    name: &str,
    email: &str,
    password: &str,
    rank: Rank,
    now: OffsetDateTime,
) -> Result<i64> {
    let name = name.trim();
    let email = email.trim().to_lowercase();
    if name.is_empty() || !email.contains('@') {
        return Err(Error::validation("a name and a valid email are required"));
    }
    if password.len() < 8 {
        return Err(Error::validation("password must be at least 8 characters"));
    }
    let exists = sqlx::query_scalar::<_, i64>("select count(*) from student where email = ?")
        .bind(&email)
        .fetch_one(database)
        .await?;
    if exists > 0 {
        return Err(Error::validation(format!("{email} is already registered")));
    }
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();
    let id = sqlx::query(
        "insert into student (name, email, password, rank, created_at) values (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(&email)
    .bind(password_hash)
    .bind(rank as i64)
    .bind(now)
    .execute(database)
    .await?
    .last_insert_rowid();
    info!(id, %email, %rank, "student created");
    Ok(id)
}

/// Checks the credentials and returns the student id. Unknown email and wrong
/// password are indistinguishable to the caller.
pub async fn login(database: &SqlitePool, email: &str, password: &str) -> Result<i64> {
    let email = email.trim().to_lowercase();
    let Some((id, hash)) =
        sqlx::query_as::<_, (i64, String)>("select id, password from student where email = ?")
            .bind(&email)
            .fetch_optional(database)
            .await?
    else {
        return Err(Error::Unauthorized);
    };
    let parsed_hash = match PasswordHash::new(&hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(id, "stored password hash is unreadable: {e}");
            return Err(Error::Unauthorized);
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .map_err(|_| Error::Unauthorized)?;
    Ok(id)
}

pub async fn delete_student(database: &SqlitePool, id: i64) -> Result<()> {
    let deleted = sqlx::query("delete from student where id = ?")
        .bind(id)
        .execute(database)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(Error::NotFound(format!("student {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, testing::T0};

    #[tokio::test]
    async fn login_round_trip() {
        let database = db::connect_memory().await.unwrap();
        let id = create_student(&database, "Kenji", "Kenji@Example.com", "hunter2hunter2", Rank::Trial, T0)
            .await
            .unwrap();
        assert_eq!(login(&database, "kenji@example.com", "hunter2hunter2").await.unwrap(), id);
        assert!(matches!(
            login(&database, "kenji@example.com", "wrong-password").await,
            Err(Error::Unauthorized)
        ));
        assert!(matches!(
            login(&database, "nobody@example.com", "hunter2hunter2").await,
            Err(Error::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn duplicate_email_and_weak_password_are_rejected() {
        let database = db::connect_memory().await.unwrap();
        create_student(&database, "Mei", "mei@example.com", "long-enough", Rank::Trial, T0)
            .await
            .unwrap();
        assert!(matches!(
            create_student(&database, "Mei", "mei@example.com", "long-enough", Rank::Trial, T0).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            create_student(&database, "Ren", "ren@example.com", "short", Rank::Trial, T0).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn info_reports_level_and_rank() {
        let database = db::connect_memory().await.unwrap();
        let config = GamificationConfig::default();
        let id = create_student(&database, "Sora", "sora@example.com", "correct-horse", Rank::Chuden, T0)
            .await
            .unwrap();
        sqlx::query("update student set experience = 2500 where id = ?")
            .bind(id)
            .execute(&database)
            .await
            .unwrap();
        let info = get_student_info(&database, &config, id).await.unwrap();
        assert_eq!(info.rank, Rank::Chuden);
        assert_eq!(info.level, 3);
        assert_eq!(get_student_list(&database, &config).await.unwrap().len(), 1);
        delete_student(&database, id).await.unwrap();
        assert!(matches!(
            get_student_info(&database, &config, id).await,
            Err(Error::NotFound(_))
        ));
    }
}
