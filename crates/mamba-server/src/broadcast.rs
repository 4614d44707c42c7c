//! Broadcast port: pushes router notifications to subscribed clients.
//!
//! Clients start with no subscriptions and manage them with
//! `{typ: "subscribe", topics: […]}`, `{typ: "subscribe_all"}` and
//! `{typ: "unsubscribe", topics: […]}` (an empty list drops everything).

use crate::protocol::{JsonCodec, Request};
use crate::router::DataRouter;
use futures::{SinkExt, StreamExt};
use mamba_core::{MambaError, MambaResult};
use serde::Deserialize;
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
struct Topics {
    #[serde(default)]
    topics: Vec<String>,
}

pub async fn serve_broadcast(listener: TcpListener, router: Arc<DataRouter>) -> MambaResult<()> {
    info!(addr = ?listener.local_addr().ok(), "broadcast service listening");
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let router = router.clone();
                let client = format!("bc-{}", Uuid::new_v4());
                tokio::spawn(async move {
                    info!(peer = %addr, client = %client, "broadcast client connected");
                    if let Err(e) = handle_client(socket, &client, &router).await {
                        warn!(peer = %addr, error = %e, "broadcast client error");
                    }
                    router.detach(&client);
                    info!(peer = %addr, client = %client, "broadcast client disconnected");
                });
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

async fn handle_client(socket: TcpStream, client: &str, router: &DataRouter) -> MambaResult<()> {
    let mut rx = router.attach(client);
    let (mut sink, mut stream) = Framed::new(socket, JsonCodec::<Json, Json>::new()).split();
    let writer = async move {
        while let Some(note) = rx.recv().await {
            sink.send(note.to_wire()).await?;
        }
        Ok::<_, MambaError>(())
    };
    let reader = async {
        while let Some(frame) = stream.next().await {
            let req = Request::from_json(frame?)?;
            control(router, client, &req)?;
        }
        Ok::<_, MambaError>(())
    };
    // Whichever side finishes first ends the connection.
    tokio::select! {
        result = writer => result,
        result = reader => result,
    }
}

fn control(router: &DataRouter, client: &str, req: &Request) -> MambaResult<()> {
    let topics: Topics = req.parse()?;
    match req.typ.as_str() {
        "subscribe" => router.subscribe(client, &topics.topics),
        "subscribe_all" => router.subscribe_all(client),
        "unsubscribe" => router.unsubscribe(client, &topics.topics),
        other => Err(MambaError::Syntax(format!("unknown broadcast request {}", other))),
    }?;
    debug!(client, typ = %req.typ, topics = ?topics.topics, "subscriptions changed");
    Ok(())
}
