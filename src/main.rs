use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rollcall::app::{Collaborators, Rollcall};
use rollcall::attendance::{Detection, NullSource, ScanEvent};
use rollcall::config::RollcallConfig;
use rollcall::identity::Portal;
use rollcall::storage::MemoryBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = RollcallConfig::from_env();

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .context("invalid log filter")?;
    fmt().with_env_filter(filter).init();

    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "rollcall starting: RUST_LOG='{}', init_timeout_ms={}, scan_cooldown_ms={}, subscribe_timeout_ms={}, seed={:?}",
        rust_log, cfg.init_timeout_ms, cfg.scan_cooldown_ms, cfg.subscribe_timeout_ms, cfg.seed_path
    );

    let seed_path = cfg.seed_path.clone().context("ROLLCALL_SEED (or seed_path in ROLLCALL_CONFIG) is required")?;
    let backend = Arc::new(MemoryBackend::from_seed_file(&seed_path)?);
    let app = Rollcall::new(Collaborators::memory(backend.clone()), Arc::new(NullSource), &cfg);

    let snap = app.session.initialize().await;
    info!(target: "startup", authenticated = snap.authenticated, role = ?snap.role, "session ready");

    if let (Ok(email), Ok(password)) = (std::env::var("ROLLCALL_EMAIL"), std::env::var("ROLLCALL_PASSWORD")) {
        let signed = app.auth.sign_in(&email, &password, Portal::Lecturer).await.map_err(|e| anyhow::anyhow!(e.user_message()))?;
        info!(target: "startup", user = %signed.identity.id, role = %signed.role, verified = signed.verified, "signed in");
    } else if !snap.authenticated {
        anyhow::bail!("not signed in: set ROLLCALL_EMAIL and ROLLCALL_PASSWORD");
    }

    let session_id = match std::env::var("ROLLCALL_SESSION") {
        Ok(id) => id,
        Err(_) => backend.first_active_session().context("seed has no active session; set ROLLCALL_SESSION")?,
    };
    let class = backend.set_session_active(&session_id, true)?;
    app.live.active_session().set(Some(class.clone()));
    if let Err(e) = app.pipeline.load_roster(&session_id).await {
        warn!(target: "startup", "could not load roster: {}", e.user_message());
    }
    for sub in [
        app.live.subscribe_to_attendance(&session_id).await,
        app.live.subscribe_to_session_status(&session_id).await,
        app.live.subscribe_to_course_updates(&class.course_id).await,
    ] {
        if let Err(e) = sub {
            warn!(target: "startup", "live updates unavailable: {}", e);
        }
    }
    info!(target: "startup", session = %session_id, health = ?app.channels.health(), "channels ready");

    let mut events = app.pipeline.events();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                ScanEvent::Detected { code, .. } => info!(target: "scan", %code, "detected"),
                ScanEvent::Marked(r) => info!(target: "scan", student = %r.student_id, status = %r.status, "marked"),
                ScanEvent::Failed { code, error } => warn!(target: "scan", %code, "{}", error.user_message()),
            }
        }
    });

    app.pipeline.scanner().start()?;
    let (tx, rx) = mpsc::channel(64);
    let pipeline = app.pipeline.clone();
    let runner = tokio::spawn(async move { pipeline.run(rx).await });

    // One scanned code per stdin line; EOF ends the scanning session.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if tx.send(Detection::now(line)).await.is_err() { break; }
    }
    drop(tx);
    runner.await?;

    info!(
        target: "startup",
        present = app.live.roster().present_count(&session_id),
        "scanning finished"
    );
    app.auth.sign_out().await?;
    Ok(())
}
