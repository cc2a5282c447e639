use anyhow::Result;
use argus_sip::{
    Handlers, Method, RequestContext, RequestHandler, ServerConfig, SipServer,
};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "argus-signal", about = "GB/T 28181 signaling gateway")]
struct Args {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory for daily rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

struct Register;

#[async_trait]
impl RequestHandler for Register {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<()> {
        let device = ctx.msg.from.uri.user.clone().unwrap_or_default();
        info!("device {device} registering from {}", ctx.conn.peer_addr());
        let mut resp = ctx.msg.reply(200, "OK");
        resp.expires = ctx.msg.expires.or(Some(3600));
        ctx.respond(resp).await
    }
}

struct Keepalive;

#[async_trait]
impl RequestHandler for Keepalive {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<()> {
        ctx.response(200, "OK").await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    argus_log::init(args.log_dir.as_deref());

    let cfg: ServerConfig = match args.config.as_ref() {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };

    let mut handlers = Handlers::new();
    handlers.on_request(Method::REGISTER, Register);
    handlers.on_request(Method::MESSAGE, Keepalive);

    let server = SipServer::new(cfg.clone(), handlers);
    server.serve().await?;
    info!("argus signaling gateway listening on {}", cfg.bind);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;

    Ok(())
}
