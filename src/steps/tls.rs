//! Optional certificate provisioning.

use tracing::info;

use crate::commands::{AptInstall, CertbotNginx, CommandArgs};
use crate::error::Result;
use crate::pipeline::{Step, StepContext};

pub struct InstallTls;

impl Step for InstallTls {
    fn name(&self) -> &'static str {
        "install-tls"
    }

    fn description(&self) -> &'static str {
        "Install Certbot and obtain Let's Encrypt certificate"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        if !ctx.config.certbot {
            info!("SSL installation skipped (certbot not requested)");
            return Ok(());
        }
        let commands = &ctx.tools.commands;
        commands.run(&AptInstall::new(["certbot", "python3-certbot-nginx"]).to_spec())?;
        commands.run(
            &CertbotNginx {
                domain: ctx.config.domain.clone(),
                email: ctx.config.email.clone(),
            }
            .to_spec(),
        )?;
        info!("SSL certificate installed");
        Ok(())
    }
}
