use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::{
    db::init_db,
    error::StoreResult,
    sqlite::{parse_ts, ts},
    types::EmailTemplate,
};

const TEMPLATE_COLUMNS: &str =
    "id, user_id, organization_id, name, subject, body, html_body, variables, created_at";

/// Template rows in the `email_templates` table.
///
/// Uses its own `Connection` so template management never contends with the
/// dispatcher's polling queries on the job store.
pub struct TemplateStore {
    db: Mutex<Connection>,
}

impl TemplateStore {
    pub fn new(conn: Connection) -> StoreResult<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }

    /// Store a new template. Names are unique per user.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        user_id: &str,
        organization_id: &str,
        name: &str,
        subject: &str,
        body: &str,
        html_body: Option<&str>,
        variables: &[String],
    ) -> StoreResult<EmailTemplate> {
        let template = EmailTemplate {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            name: name.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            html_body: html_body.map(str::to_string),
            variables: variables.to_vec(),
            created_at: Utc::now(),
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO email_templates
             (id, user_id, organization_id, name, subject, body, html_body, variables, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                template.id,
                template.user_id,
                template.organization_id,
                template.name,
                template.subject,
                template.body,
                template.html_body,
                serde_json::to_string(&template.variables)?,
                ts(template.created_at),
            ],
        )?;
        info!(template_id = %template.id, name = %template.name, "template created");
        Ok(template)
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<EmailTemplate>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE id = ?1"),
            [id],
            raw_template,
        )
        .optional()?
        .map(into_template)
        .transpose()
    }

    /// All templates owned by `user_id`, alphabetical by name.
    pub fn list_for_owner(&self, user_id: &str) -> StoreResult<Vec<EmailTemplate>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE user_id = ?1 ORDER BY name"
        ))?;
        let rows = stmt
            .query_map([user_id], raw_template)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_template).collect()
    }
}

type RawTemplate = (EmailTemplate, String, String);

/// Read a row, leaving the JSON and timestamp columns for [`into_template`].
fn raw_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTemplate> {
    Ok((
        EmailTemplate {
            id: row.get(0)?,
            user_id: row.get(1)?,
            organization_id: row.get(2)?,
            name: row.get(3)?,
            subject: row.get(4)?,
            body: row.get(5)?,
            html_body: row.get(6)?,
            variables: Vec::new(),
            created_at: Utc::now(),
        },
        row.get(7)?,
        row.get(8)?,
    ))
}

fn into_template((mut template, variables, created_at): RawTemplate) -> StoreResult<EmailTemplate> {
    template.variables = serde_json::from_str(&variables)?;
    template.created_at = parse_ts(&created_at)?;
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn store() -> TemplateStore {
        TemplateStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn create_then_get() {
        let store = store();
        let vars = vec!["first_name".to_string()];
        let created = store
            .create("u-1", "org-1", "welcome", "Hi {{first_name}}", "Welcome!", None, &vars)
            .unwrap();

        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.name, "welcome");
        assert_eq!(fetched.variables, vars);
        assert_eq!(fetched.html_body, None);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn names_are_unique_per_user() {
        let store = store();
        store
            .create("u-1", "org-1", "digest", "s", "b", None, &[])
            .unwrap();
        assert!(matches!(
            store.create("u-1", "org-1", "digest", "s2", "b2", None, &[]),
            Err(StoreError::Sqlite(_))
        ));
        // Another user may reuse the name.
        store
            .create("u-2", "org-1", "digest", "s", "b", Some("<p>b</p>"), &[])
            .unwrap();
    }

    #[test]
    fn list_for_owner_is_sorted_and_scoped() {
        let store = store();
        store.create("u-1", "o", "zeta", "s", "b", None, &[]).unwrap();
        store.create("u-1", "o", "alpha", "s", "b", None, &[]).unwrap();
        store.create("u-2", "o", "beta", "s", "b", None, &[]).unwrap();

        let names: Vec<_> = store
            .list_for_owner("u-1")
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
