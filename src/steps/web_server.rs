//! Web server site configuration.

use tracing::{debug, info};

use crate::commands::{CommandArgs, NginxConfigTest, ServiceAction, Systemctl};
use crate::config::Configuration;
use crate::error::Result;
use crate::pipeline::{Step, StepContext};
use crate::steps::{backup_path, resolve_conflict, timestamp, Disposition};

/// Server block for the site: apex and `www.`, PHP through the FPM socket.
pub fn render_server_block(config: &Configuration) -> String {
    format!(
        r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain} www.{domain};

    root {root};
    index index.php index.html index.htm;

    # Upload size limits (matches PHP settings)
    client_max_body_size 64M;

    location / {{
        try_files $uri $uri/ /index.php?$args;
    }}

    location ~ \.php$ {{
        include snippets/fastcgi-php.conf;
        fastcgi_pass unix:{socket};
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        include fastcgi_params;
    }}

    location ~ /\.ht {{
        deny all;
    }}

    location = /favicon.ico {{
        log_not_found off;
        access_log off;
    }}

    location = /robots.txt {{
        allow all;
        log_not_found off;
        access_log off;
    }}

    location ~* \.(css|gif|ico|jpeg|jpg|js|png)$ {{
        expires max;
        log_not_found off;
    }}
}}
"#,
        domain = config.domain,
        root = config.web_root().display(),
        socket = config.php_fpm_socket(),
    )
}

pub struct ConfigureWebServer;

impl Step for ConfigureWebServer {
    fn name(&self) -> &'static str {
        "configure-web-server"
    }

    fn description(&self) -> &'static str {
        "Create Nginx site configuration for WordPress"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let tools = ctx.tools;
        let config_path = ctx.config.site_config_path();
        let content = render_server_block(ctx.config);

        let disposition = resolve_conflict(
            tools.files.exists(&config_path),
            &format!("Nginx config {}", config_path.display()),
            ctx.config.overwrite,
        )?;
        if disposition == Disposition::Replace {
            let backup = backup_path(&config_path, &timestamp());
            ctx.state.record_site_config_backup(&backup);
            tools.files.rename(&config_path, &backup)?;
            info!("Backed up {} -> {}", config_path.display(), backup.display());
        }

        ctx.state.record_site_config(&config_path);
        debug!(config_size = content.len(), "writing Nginx configuration");
        tools.files.write_atomic(&config_path, &content, 0o644)?;

        let link = ctx.config.site_link_path();
        ctx.state.record_site_link(&link);
        if tools.files.exists(&link) {
            tools.files.remove(&link)?;
        }
        tools.files.symlink(&config_path, &link)?;

        let default_site = ctx.config.layout.sites_enabled.join("default");
        if tools.files.exists(&default_site) {
            debug!("Removing default Nginx site");
            tools.files.remove(&default_site)?;
        }

        tools.commands.run(&NginxConfigTest.to_spec())?;
        tools
            .commands
            .run(&Systemctl::new(ServiceAction::Reload, "nginx").to_spec())?;
        info!("Nginx configured for site");
        Ok(())
    }
}
