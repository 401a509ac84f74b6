//! User queries for the auth fabric

use sqlx::PgPool;
use uuid::Uuid;

use super::User;
use crate::error::{Error, Result};

const USER_COLUMNS: &str = "id, username, email, password_hash, is_admin, approved_at, \
     suspended_at, deleted_at, totp_secret_encrypted, totp_enabled, created_at";

/// Insert a new (unapproved) user. Duplicate usernames or emails map to a
/// `CONFLICT` response.
pub async fn create(
    pool: &PgPool,
    username: &str,
    email: Option<&str>,
    password_hash: &str,
) -> Result<User> {
    let query = format!(
        "INSERT INTO users (id, username, email, password_hash) \
         VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
    );

    sqlx::query_as::<_, User>(&query)
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_one(pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return Error::Conflict("username or email already registered".into());
                }
            }
            Error::from(e)
        })
}

/// Fetch by username (case-sensitive, exact match)
pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
    Ok(sqlx::query_as::<_, User>(&query)
        .bind(username)
        .fetch_optional(pool)
        .await?)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    Ok(sqlx::query_as::<_, User>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

pub async fn find_by_email(pool: &PgPool, email: &str) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 AND deleted_at IS NULL");
    Ok(sqlx::query_as::<_, User>(&query)
        .bind(email)
        .fetch_optional(pool)
        .await?)
}

/// Store a freshly enrolled (not yet verified) TOTP secret
pub async fn set_totp_secret(pool: &PgPool, user_id: Uuid, encrypted: &str) -> Result<()> {
    sqlx::query("UPDATE users SET totp_secret_encrypted = $2, totp_enabled = false WHERE id = $1")
        .bind(user_id)
        .bind(encrypted)
        .execute(pool)
        .await?;
    Ok(())
}

/// Flip the enabled flag once the first code has verified
pub async fn enable_totp(pool: &PgPool, user_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE users SET totp_enabled = true WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_password(pool: &PgPool, user_id: Uuid, password_hash: &str) -> Result<()> {
    sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
        .bind(user_id)
        .bind(password_hash)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace the user's recovery codes with a fresh set of digests.
///
/// Runs in one transaction so enrollment always leaves exactly the new set.
pub async fn replace_recovery_codes(pool: &PgPool, user_id: Uuid, digests: &[String]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM mfa_recovery_codes WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

    for digest in digests {
        sqlx::query("INSERT INTO mfa_recovery_codes (id, user_id, code_hash) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(digest)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Redeem a recovery code by digest.
///
/// The conditional update makes redemption single-use across all processes:
/// of two concurrent attempts with the same code, exactly one sees an
/// unused row.
pub async fn redeem_recovery_code(pool: &PgPool, user_id: Uuid, digest: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE mfa_recovery_codes SET used_at = now() \
         WHERE user_id = $1 AND code_hash = $2 AND used_at IS NULL",
    )
    .bind(user_id)
    .bind(digest)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Count of codes still redeemable, surfaced after MFA login
pub async fn unused_recovery_codes(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    let count: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM mfa_recovery_codes WHERE user_id = $1 AND used_at IS NULL",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count.0)
}
