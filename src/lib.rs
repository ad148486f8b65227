pub mod config;

use std::sync::Arc;

use self::config::Config;

use transport::{Node, NodeOptions};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "ferry.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the crate directly, a
/// function is opened to replace the main function and start the node.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("{} starting", SOFTWARE);

    match config.node.role {
        config::Role::Server => {
            let node = Node::bind(NodeOptions {
                role: config.node.role.as_role(),
                listen: Some(config.node.listen),
                port_file: Some(config.node.port_file.clone()),
                rma: config.node.rma.as_mode(),
            })
            .await?;

            log::info!("node listening: {}", node.port_name());
            log::info!("port name published: {}", config.node.port_file.display());

            tokio::signal::ctrl_c().await?;
            node.finalize().await?;
        }
        config::Role::Client => {
            let name = transport::read_port_name(&config.node.port_file)?;
            let node = Node::bind(NodeOptions {
                role: config.node.role.as_role(),
                listen: None,
                port_file: None,
                rma: config.node.rma.as_mode(),
            })
            .await?;

            let address = node.addr_lookup(&name).await?;
            log::info!("reached server: {}", name.trim_end_matches('\0'));

            node.addr_free(&address).await?;
            node.finalize().await?;
        }
    }

    Ok(())
}
