//! Unix-domain-socket accept loop: a `tokio::select!` between shutdown
//! and accept-readiness, one spawned task per connection, `debug!`/`warn!`
//! tracing at the same density as the other protocol servers in this tree.

use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::enumeration::{EnumKind, EnumRow, GetentCursor};
use crate::error::ResponderError;
use crate::sysdb::SysdbRecord;
use crate::protocol::codec::{self, Command, Frame, ReplyFrame};
use crate::responder::ResponderContext;

pub async fn run_unix_server(
    ctx: Arc<ResponderContext>,
    socket_path: &std::path::Path,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "responder listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("unix server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(ctx, stream).await {
                                debug!(error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(ctx: Arc<ResponderContext>, mut stream: UnixStream) -> std::io::Result<()> {
    let mut pw_cursor = GetentCursor::default();
    let mut gr_cursor = GetentCursor::default();
    let mut sv_cursor = GetentCursor::default();

    loop {
        let frame = match codec::read_frame(&mut stream).await {
            Ok(f) => f,
            Err(ResponderError::Io(_)) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "failed to read request frame");
                return Ok(());
            }
        };

        let cmd = frame.cmd;
        ctx.metrics.requests_total.inc();
        let reply = match dispatch(&ctx, frame, &mut pw_cursor, &mut gr_cursor, &mut sv_cursor).await {
            Ok(body) => ReplyFrame { cmd, status: 0, body },
            Err(e) => {
                ctx.metrics.requests_failed.inc();
                let fatal = e.is_fatal();
                let status = e.status_code();
                debug!(error = %e, command = ?cmd, "request failed");
                let body = bytes::BytesMut::new();
                if fatal {
                    codec::write_reply(&mut stream, ReplyFrame { cmd, status, body }).await.ok();
                    error!("fatal error, closing connection");
                    return Ok(());
                }
                ReplyFrame { cmd, status, body }
            }
        };

        if let Err(e) = codec::write_reply(&mut stream, reply).await {
            warn!(error = %e, "failed to write reply frame");
            return Ok(());
        }
    }
}

async fn dispatch(
    ctx: &ResponderContext,
    mut frame: Frame,
    pw_cursor: &mut GetentCursor,
    gr_cursor: &mut GetentCursor,
    sv_cursor: &mut GetentCursor,
) -> crate::error::Result<bytes::BytesMut> {
    let domains = ctx.domains_snapshot();

    match frame.cmd {
        Command::GetVersion => Ok(bytes::BytesMut::from(&1u32.to_le_bytes()[..])),

        Command::GetpwNam => {
            let name = codec::read_cstr(&mut frame.body)?;
            crate::pipeline::validate_name(&name)?;
            ctx.pipeline.getpwnam(&domains, &name).await
        }
        Command::GetpwUid => {
            let uid = codec::read_u32(&mut frame.body)?;
            ctx.pipeline.getpwuid(&domains, uid).await
        }
        Command::GetgrNam => {
            let name = codec::read_cstr(&mut frame.body)?;
            crate::pipeline::validate_name(&name)?;
            ctx.pipeline.getgrnam(&domains, &name).await
        }
        Command::GetgrGid => {
            let gid = codec::read_u32(&mut frame.body)?;
            ctx.pipeline.getgrgid(&domains, gid).await
        }
        Command::Initgr => {
            let name = codec::read_cstr(&mut frame.body)?;
            crate::pipeline::validate_name(&name)?;
            ctx.pipeline.initgroups(&domains, &name).await
        }
        Command::GetsidByName => {
            let name = codec::read_cstr(&mut frame.body)?;
            ctx.pipeline.getsidbyname(&domains, &name).await
        }
        Command::GetsidById => {
            let id = codec::read_u32(&mut frame.body)?;
            ctx.pipeline.getsidbyid(&domains, id).await
        }
        Command::GetnameBySid => {
            let sid = codec::read_cstr(&mut frame.body)?;
            ctx.pipeline.getnamebysid(&domains, &sid).await
        }
        Command::GetidBySid => {
            let sid = codec::read_cstr(&mut frame.body)?;
            ctx.pipeline.getidbysid(&domains, &sid).await
        }

        Command::SetpwEnt => {
            *pw_cursor = ctx.enumeration.setxxent(&domains, EnumKind::Users).await?;
            Ok(crate::reply::empty_reply())
        }
        Command::GetpwEnt => {
            let n = codec::read_u32(&mut frame.body)? as usize;
            let rows = ctx
                .enumeration
                .getxxent(&domains, EnumKind::Users, pw_cursor, n)
                .await?;
            let entries = unwrap_account_rows(rows, &domains)?;
            Ok(crate::reply::encode_passwd_reply(&entries, &ctx.pipeline.shell_policy))
        }
        Command::EndpwEnt => {
            ctx.enumeration.endxxent(pw_cursor);
            Ok(crate::reply::empty_reply())
        }

        Command::SetgrEnt => {
            *gr_cursor = ctx.enumeration.setxxent(&domains, EnumKind::Groups).await?;
            Ok(crate::reply::empty_reply())
        }
        Command::GetgrEnt => {
            let n = codec::read_u32(&mut frame.body)? as usize;
            let rows = ctx
                .enumeration
                .getxxent(&domains, EnumKind::Groups, gr_cursor, n)
                .await?;
            let entries: Vec<_> = unwrap_account_rows(rows, &domains)?
                .into_iter()
                .map(|(r, d)| {
                    let members = crate::pipeline::member_names(&r);
                    (r, d, members)
                })
                .collect();
            Ok(crate::reply::encode_group_reply(&entries))
        }
        Command::EndgrEnt => {
            ctx.enumeration.endxxent(gr_cursor);
            Ok(crate::reply::empty_reply())
        }

        Command::SetNetgrEnt | Command::GetNetgrEnt | Command::EndNetgrEnt => {
            // Accepted by the framing layer; no netgroup entity is modeled
            // (DESIGN.md open-question resolution #4).
            Err(ResponderError::Unsupported)
        }

        Command::GetservByName => {
            let name = codec::read_cstr(&mut frame.body)?;
            let proto = codec::read_cstr(&mut frame.body)?;
            ctx.pipeline.getservbyname(&domains, &name, &proto).await
        }
        Command::GetservByPort => {
            let port = codec::read_u16(&mut frame.body)?;
            let proto = codec::read_cstr(&mut frame.body)?;
            ctx.pipeline.getservbyport(&domains, port, &proto).await
        }
        Command::SetservEnt => {
            *sv_cursor = ctx.enumeration.setxxent(&domains, EnumKind::Services).await?;
            Ok(crate::reply::empty_reply())
        }
        Command::GetservEnt => {
            let n = codec::read_u32(&mut frame.body)? as usize;
            let rows = ctx
                .enumeration
                .getxxent(&domains, EnumKind::Services, sv_cursor, n)
                .await?;
            let entries: Vec<_> = rows
                .into_iter()
                .filter_map(|(r, _domain)| match r {
                    EnumRow::Service(s) => Some(s),
                    EnumRow::Account(_) => {
                        warn!("unexpected account row in service enumeration cursor");
                        None
                    }
                })
                .collect();
            Ok(crate::reply::encode_service_reply(&entries))
        }
        Command::EndservEnt => {
            ctx.enumeration.endxxent(sv_cursor);
            Ok(crate::reply::empty_reply())
        }
    }
}

/// Unwraps `EnumRow::Account` rows from a Users/Groups cursor page,
/// pairing each with the actual domain it was enumerated from (so
/// per-domain qualify/override rules apply correctly even when a single
/// page spans more than one domain). A `Service` row here means the
/// cursor was built against the wrong `EnumKind`, treated as a backend
/// bug rather than silently dropped.
fn unwrap_account_rows(
    rows: Vec<(EnumRow, String)>,
    domains: &[crate::domain::Domain],
) -> crate::error::Result<Vec<(SysdbRecord, crate::domain::Domain)>> {
    rows.into_iter()
        .map(|(r, domain_name)| match r {
            EnumRow::Account(record) => {
                let domain = domains
                    .iter()
                    .find(|d| d.name == domain_name)
                    .cloned()
                    .unwrap_or_else(default_domain);
                Ok((record, domain))
            }
            EnumRow::Service(_) => Err(ResponderError::Fatal(
                "service row returned from an account enumeration cursor".into(),
            )),
        })
        .collect()
}

fn default_domain() -> crate::domain::Domain {
    crate::domain::Domain {
        name: String::new(),
        domain_sid: None,
        id_min: 0,
        id_max: u32::MAX,
        enumerate: false,
        fqnames: false,
        case_sensitive: true,
        mpg: false,
        override_gid: None,
        override_homedir: None,
        fallback_homedir: None,
        override_shell: None,
        default_shell: None,
        subdomains: vec![],
        has_provider: false,
    }
}
