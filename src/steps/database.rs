//! Database server and application database steps.

use tracing::{debug, info, warn};

use crate::cleanup::drop_database_sql;
use crate::commands::{sql_literal, AptInstall, CommandArgs, MysqlStatement};
use crate::config::DatabaseSettings;
use crate::error::Result;
use crate::pipeline::{Step, StepContext};
use crate::run_state::DatabaseIdentity;
use crate::steps::{resolve_conflict, Disposition};

/// Statements that lock the server down to local socket access.
pub const HARDENING: &[&str] = &[
    "DELETE FROM mysql.user WHERE User='';",
    "DELETE FROM mysql.user WHERE User='root' AND Host NOT IN ('localhost');",
    "DROP DATABASE IF EXISTS test;",
    "DELETE FROM mysql.db WHERE Db='test' OR Db LIKE 'test\\_%';",
    "FLUSH PRIVILEGES;",
];

const SOCKET_AUTH: &str = "ALTER USER 'root'@'localhost' IDENTIFIED WITH auth_socket;";

/// Create database and user, grant, flush.
pub fn create_database_sql(db: &DatabaseSettings) -> String {
    let user = sql_literal(&db.user);
    format!(
        "CREATE DATABASE IF NOT EXISTS `{name}` DEFAULT CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci; \
         CREATE USER IF NOT EXISTS {user}@'localhost' IDENTIFIED BY {password}; \
         GRANT ALL PRIVILEGES ON `{name}`.* TO {user}@'localhost'; \
         FLUSH PRIVILEGES;",
        name = db.name,
        password = sql_literal(&db.password),
    )
}

/// Read-only existence lookup for the schema.
pub fn schema_exists_sql(name: &str) -> String {
    format!(
        "SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = {};",
        sql_literal(name)
    )
}

/// Read-only existence lookup for the local account.
pub fn user_exists_sql(user: &str) -> String {
    format!(
        "SELECT User FROM mysql.user WHERE User = {} AND Host = 'localhost';",
        sql_literal(user)
    )
}

fn listed(output: Option<String>, value: &str) -> bool {
    output.is_some_and(|out| out.lines().any(|l| l.trim() == value))
}

pub struct InstallMysql;

impl Step for InstallMysql {
    fn name(&self) -> &'static str {
        "install-mysql"
    }

    fn description(&self) -> &'static str {
        "Install MySQL server and secure it"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let commands = &ctx.tools.commands;
        commands.run(&AptInstall::new(["mysql-server"]).to_spec())?;

        // Already socket-authenticated servers reject this; not fatal
        let socket = commands.execute(&MysqlStatement::new(SOCKET_AUTH).to_spec(), false, false)?;
        if socket.success() {
            info!("MySQL root configured for socket authentication");
        } else {
            warn!("Could not switch root to socket authentication: {}", socket.stderr.trim());
        }

        for sql in HARDENING {
            debug!(sql, "hardening MySQL");
            commands.run(&MysqlStatement::new(*sql).to_spec())?;
        }
        info!("MySQL secured (root login via local socket only, no remote access)");
        Ok(())
    }
}

pub struct CreateDatabase;

impl Step for CreateDatabase {
    fn name(&self) -> &'static str {
        "create-database"
    }

    fn description(&self) -> &'static str {
        "Create WordPress database and user"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let db = &ctx.config.database;
        let commands = &ctx.tools.commands;
        ctx.state.record_database_identity(&db.name, &db.user);

        let schema_exists = listed(
            commands.inspect(&MysqlStatement::query(schema_exists_sql(&db.name)).to_spec()),
            &db.name,
        );
        let user_exists = listed(
            commands.inspect(&MysqlStatement::query(user_exists_sql(&db.user)).to_spec()),
            &db.user,
        );
        // A pre-existing account keeps its own password, so it conflicts too
        let schema = resolve_conflict(
            schema_exists,
            &format!("Database {}", db.name),
            ctx.config.overwrite,
        )?;
        let user = resolve_conflict(
            user_exists,
            &format!("Database user {}", db.user),
            ctx.config.overwrite,
        )?;

        if schema == Disposition::Replace || user == Disposition::Replace {
            info!("Dropping existing database and user");
            let identity = DatabaseIdentity {
                name: db.name.clone(),
                user: db.user.clone(),
            };
            commands.run(&MysqlStatement::new(drop_database_sql(&identity)).to_spec())?;
        }

        ctx.state.record_database_created(&db.name, &db.user);
        commands.run(&MysqlStatement::new(create_database_sql(db)).to_spec())?;
        info!(db = %db.name, user = %db.user, "Database creation step complete");
        Ok(())
    }
}
