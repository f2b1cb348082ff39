use agenthost_control_plane::{Instance, NewInstance, ProviderHandles, ProviderKind};
use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::MigrationHarness;

use crate::models::schema::instances;
use crate::models::MIGRATIONS;
use crate::store::{InstanceStore, InstanceUpdate};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

#[derive(Queryable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = instances)]
#[diesel(treat_none_as_null = true)]
pub struct InstanceRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub provider: String,
    pub region: String,
    pub model: String,
    pub ai_provider: String,
    pub bot_token: Option<String>,
    pub fly_app_name: Option<String>,
    pub fly_machine_id: Option<String>,
    pub container_id: Option<String>,
    pub container_port: Option<i32>,
    pub status: String,
    pub ip_address: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Instance> for InstanceRow {
    fn from(instance: &Instance) -> Self {
        let (fly_app_name, fly_machine_id, container_id, container_port) = match &instance.handles
        {
            Some(ProviderHandles::Fly {
                app_name,
                machine_id,
            }) => (app_name.clone(), machine_id.clone(), None, None),
            Some(ProviderHandles::Docker { container_id, port }) => {
                (None, None, container_id.clone(), port.map(i32::from))
            }
            None => (None, None, None, None),
        };
        Self {
            id: instance.id.clone(),
            user_id: instance.user_id.clone(),
            name: instance.name.clone(),
            provider: instance.provider.as_str().to_string(),
            region: instance.region.clone(),
            model: instance.model.clone(),
            ai_provider: instance.ai_provider.as_str().to_string(),
            bot_token: instance.bot_token.clone(),
            fly_app_name,
            fly_machine_id,
            container_id,
            container_port,
            status: instance.status.as_str().to_string(),
            ip_address: instance.ip_address.clone(),
            is_default: instance.is_default,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

impl TryFrom<InstanceRow> for Instance {
    type Error = anyhow::Error;

    fn try_from(row: InstanceRow) -> anyhow::Result<Self> {
        let provider: ProviderKind = row.provider.parse()?;
        let handles = row_handles(
            provider,
            row.fly_app_name,
            row.fly_machine_id,
            row.container_id,
            row.container_port,
        )
        .with_context(|| format!("instance {} has inconsistent provider columns", row.id))?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            provider,
            region: row.region,
            model: row.model,
            ai_provider: row.ai_provider.parse()?,
            bot_token: row.bot_token,
            handles,
            status: row.status.parse()?,
            ip_address: row.ip_address,
            is_default: row.is_default,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Rebuilds handles from the flat columns. Columns belonging to the other provider
/// must be empty.
fn row_handles(
    provider: ProviderKind,
    fly_app_name: Option<String>,
    fly_machine_id: Option<String>,
    container_id: Option<String>,
    container_port: Option<i32>,
) -> anyhow::Result<Option<ProviderHandles>> {
    let has_fly = fly_app_name.is_some() || fly_machine_id.is_some();
    let has_docker = container_id.is_some() || container_port.is_some();
    match provider {
        ProviderKind::Fly => {
            if has_docker {
                anyhow::bail!("fly instance carries container columns");
            }
            Ok(has_fly.then_some(ProviderHandles::Fly {
                app_name: fly_app_name,
                machine_id: fly_machine_id,
            }))
        }
        ProviderKind::Docker => {
            if has_fly {
                anyhow::bail!("docker instance carries fly columns");
            }
            if !has_docker {
                return Ok(None);
            }
            let port = container_port
                .map(u16::try_from)
                .transpose()
                .context("container port out of range")?;
            Ok(Some(ProviderHandles::Docker { container_id, port }))
        }
    }
}

pub struct PgInstanceStore {
    pool: DbPool,
}

impl PgInstanceStore {
    /// Opens a pool against `database_url` and applies pending migrations.
    pub fn connect(database_url: &str) -> anyhow::Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .build(manager)
            .context("build database connection pool")?;
        let mut conn = pool.get().context("get database connection")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow::anyhow!("run database migrations: {err}"))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> anyhow::Result<PooledConnection<ConnectionManager<PgConnection>>> {
        self.pool.get().context("get database connection")
    }
}

impl InstanceStore for PgInstanceStore {
    fn get(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        let conn = &mut self.conn()?;
        instances::table
            .find(id)
            .first::<InstanceRow>(conn)
            .optional()?
            .map(Instance::try_from)
            .transpose()
    }

    fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Instance>> {
        let conn = &mut self.conn()?;
        instances::table
            .filter(instances::user_id.eq(user_id))
            .order((instances::created_at.asc(), instances::id.asc()))
            .load::<InstanceRow>(conn)?
            .into_iter()
            .map(Instance::try_from)
            .collect()
    }

    fn create(&self, new: NewInstance) -> anyhow::Result<Instance> {
        let conn = &mut self.conn()?;
        let row = InstanceRow::from(&Instance::from_new(new, Utc::now()));
        let saved = diesel::insert_into(instances::table)
            .values(&row)
            .get_result::<InstanceRow>(conn)?;
        Instance::try_from(saved)
    }

    fn update(&self, id: &str, update: InstanceUpdate) -> anyhow::Result<Instance> {
        let conn = &mut self.conn()?;
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            let row = instances::table
                .find(id)
                .for_update()
                .first::<InstanceRow>(conn)
                .optional()?
                .with_context(|| format!("instance {id} does not exist"))?;
            let mut instance = Instance::try_from(row)?;
            update.apply_to(&mut instance)?;

            let saved = diesel::update(instances::table.find(id))
                .set(&InstanceRow::from(&instance))
                .get_result::<InstanceRow>(conn)?;
            Instance::try_from(saved)
        })
    }

    fn upsert(&self, instance: Instance) -> anyhow::Result<Instance> {
        let conn = &mut self.conn()?;
        let row = InstanceRow::from(&instance);
        let saved = diesel::insert_into(instances::table)
            .values(&row)
            .on_conflict(instances::id)
            .do_update()
            .set(&row)
            .get_result::<InstanceRow>(conn)?;
        Instance::try_from(saved)
    }

    fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let conn = &mut self.conn()?;
        let removed = diesel::delete(instances::table.find(id)).execute(conn)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenthost_control_plane::{AiProvider, InstanceStatus};

    fn instance(provider: ProviderKind, handles: Option<ProviderHandles>) -> Instance {
        let mut instance = Instance::from_new(
            NewInstance {
                id: "inst-1".to_string(),
                user_id: "u1".to_string(),
                name: "bot".to_string(),
                provider,
                region: "lax".to_string(),
                model: "gemini-2.0-flash".to_string(),
                ai_provider: AiProvider::Google,
                bot_token: Some("sealed-value".to_string()),
                status: InstanceStatus::Running,
                is_default: true,
            },
            Utc::now(),
        );
        instance.handles = handles;
        instance
    }

    #[test]
    fn fly_instance_survives_row_conversion() {
        let original = instance(
            ProviderKind::Fly,
            Some(ProviderHandles::Fly {
                app_name: Some("agent-abc".to_string()),
                machine_id: Some("m-1".to_string()),
            }),
        );
        let row = InstanceRow::from(&original);
        assert_eq!(row.provider, "fly");
        assert_eq!(row.ai_provider, "google");
        assert_eq!(row.status, "RUNNING");
        assert_eq!(row.fly_machine_id.as_deref(), Some("m-1"));
        assert_eq!(row.container_id, None);
        assert_eq!(Instance::try_from(row).unwrap(), original);
    }

    #[test]
    fn docker_port_survives_row_conversion() {
        let original = instance(
            ProviderKind::Docker,
            Some(ProviderHandles::Docker {
                container_id: Some("c0ffee".to_string()),
                port: Some(49153),
            }),
        );
        let row = InstanceRow::from(&original);
        assert_eq!(row.container_port, Some(49153));
        assert_eq!(Instance::try_from(row).unwrap(), original);
    }

    #[test]
    fn rows_without_handle_columns_have_no_handles() {
        let row = InstanceRow::from(&instance(ProviderKind::Fly, None));
        assert_eq!(Instance::try_from(row).unwrap().handles, None);
    }

    #[test]
    fn mixed_provider_columns_are_rejected() {
        let mut row = InstanceRow::from(&instance(ProviderKind::Fly, None));
        row.container_id = Some("c0ffee".to_string());
        let err = Instance::try_from(row).unwrap_err();
        assert!(format!("{err:#}").contains("fly instance carries container columns"));

        let mut row = InstanceRow::from(&instance(ProviderKind::Docker, None));
        row.container_port = Some(70_000);
        assert!(Instance::try_from(row).is_err());
    }

    #[test]
    fn unknown_enum_text_is_rejected() {
        let mut row = InstanceRow::from(&instance(ProviderKind::Fly, None));
        row.status = "EXPLODED".to_string();
        assert!(Instance::try_from(row).is_err());
    }
}
