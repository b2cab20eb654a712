//! Engine and connector tests against an in-process NNTP server
//!
//! ```bash
//! cargo test --test nntp_triage
//! ```

mod common;

use common::{FakeNntpServer, generate_yenc_content, rar4_volume_head, rar_release, segment_id};
use nzb_triage::{
    ArchiveStatus, ArticleBody, ArticleStatus, Blocker, Connector, NntpConnector, Status, TriageConfig,
    TriageEngine, TriageOutcome, Verdict,
};

/// Publish every segment of `names` (each `segments` long); the first segment of
/// the first volume carries `head`
fn publish_release(server: &FakeNntpServer, names: &[String], segments: usize, head: &[u8]) {
    for (volume, name) in names.iter().enumerate() {
        for n in 1..=segments {
            let data = if volume == 0 && n == 1 {
                head.to_vec()
            } else {
                vec![0x5a; 256]
            };
            server.add_article(&segment_id(name, n), generate_yenc_content(&data, name));
        }
    }
}

fn engine_for(server: &FakeNntpServer) -> TriageEngine {
    TriageEngine::from_config(TriageConfig {
        server: Some(server.server_config()),
        max_connections: 4,
        ..TriageConfig::default()
    })
}

fn completed(outcome: TriageOutcome) -> nzb_triage::TriageSummary {
    match outcome {
        TriageOutcome::Completed(summary) => summary,
        TriageOutcome::TimedOut => panic!("triage timed out"),
    }
}

#[tokio::test]
async fn connector_speaks_stat_body_and_date() {
    let server = FakeNntpServer::start().await;
    let body = generate_yenc_content(b".leading dot and more", "a.bin");
    server.add_article("a@nzb-triage.test", body.clone());

    let connector = NntpConnector::new(server.server_config());
    let mut session = connector.connect().await.unwrap();

    assert_eq!(
        session.stat("a@nzb-triage.test").await.unwrap(),
        ArticleStatus::Present
    );
    assert_eq!(
        session.stat("<gone@nzb-triage.test>").await.unwrap(),
        ArticleStatus::Missing
    );
    assert_eq!(
        session.body("a@nzb-triage.test", 64 * 1024).await.unwrap(),
        Some(ArticleBody {
            data: body,
            complete: true
        })
    );
    assert_eq!(session.body("gone@nzb-triage.test", 64 * 1024).await.unwrap(), None);
    session.ping().await.unwrap();
    session.quit().await;

    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn connector_stops_reading_a_body_at_the_limit() {
    let server = FakeNntpServer::start().await;
    server.add_article(
        "big@nzb-triage.test",
        generate_yenc_content(&[0x5a; 50_000], "big.bin"),
    );

    let connector = NntpConnector::new(server.server_config());
    let mut session = connector.connect().await.unwrap();

    let body = session.body("big@nzb-triage.test", 1000).await.unwrap().unwrap();
    assert!(!body.complete);
    assert!(body.data.len() <= 1000);
    assert!(body.data.starts_with(b"=ybegin "));
    assert!(session.stat("big@nzb-triage.test").await.is_err());
    session.quit().await;
}

#[tokio::test]
async fn oversized_head_segment_stays_within_the_decode_cap() {
    let server = FakeNntpServer::start().await;
    let (nzb, names) = rar_release("Huge.Segments", 1, 2);
    let mut head = rar4_volume_head("movie.mkv", 0x30);
    head.extend(std::iter::repeat_n(0x5a, 200_000));
    publish_release(&server, &names, 2, &head);

    let engine = TriageEngine::from_config(TriageConfig {
        server: Some(server.server_config()),
        max_connections: 2,
        max_decoded_bytes: 4096,
        ..TriageConfig::default()
    });
    let summary = completed(engine.triage(&[nzb.into_bytes()]).await);
    let decision = summary.decision(0).unwrap();

    assert_eq!(decision.archive_findings[0].status, ArchiveStatus::RarStored);
    assert!(summary.metrics.decoded_bytes <= 4096);
    assert!(summary.metrics.body_bytes <= 4096 + 1024);
}

#[tokio::test]
async fn connector_authenticates() {
    let server = FakeNntpServer::start_with_auth("reader", "s3cret").await;
    server.add_article("a@nzb-triage.test", generate_yenc_content(b"x", "a.bin"));

    let connector = NntpConnector::new(server.server_config());
    let mut session = connector.connect().await.unwrap();
    assert_eq!(
        session.stat("a@nzb-triage.test").await.unwrap(),
        ArticleStatus::Present
    );

    let mut wrong = server.server_config();
    wrong.password = Some("nope".into());
    assert!(NntpConnector::new(wrong).connect().await.is_err());
}

#[tokio::test]
async fn connector_reports_refused_connections() {
    let mut config = nzb_triage::ServerConfig::new("127.0.0.1");
    config.port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let err = NntpConnector::new(config).connect().await.err().unwrap();
    assert!(err.is_connection_failure(), "unexpected error: {err}");
}

#[tokio::test]
async fn stored_release_is_verified_over_the_wire() {
    let server = FakeNntpServer::start().await;
    let (nzb, names) = rar_release("Some.Movie.2024", 3, 4);
    publish_release(&server, &names, 4, &rar4_volume_head("movie.mkv", 0x30));

    let summary = completed(engine_for(&server).triage(&[nzb.into_bytes()]).await);
    let decision = summary.decision(0).unwrap();

    assert_eq!(decision.decision, Verdict::Accept);
    assert_eq!(decision.status(), Status::Verified);
    assert_eq!(decision.file_count, Some(3));
    assert_eq!(decision.nzb_title.as_deref(), Some("Some.Movie.2024"));
    assert_eq!(decision.archive_findings.len(), 1);
    assert_eq!(decision.archive_findings[0].status, ArchiveStatus::RarStored);
    assert!(server.stat_commands() > 0);
    assert_eq!(server.body_commands(), 1);
    assert_eq!(summary.metrics.body_successes, 1);
}

#[tokio::test]
async fn compressed_release_is_blocked_over_the_wire() {
    let server = FakeNntpServer::start().await;
    let (nzb, names) = rar_release("Packed.Release", 2, 3);
    publish_release(&server, &names, 3, &rar4_volume_head("movie.mkv", 0x33));

    let summary = completed(engine_for(&server).triage(&[nzb.into_bytes()]).await);
    let decision = summary.decision(0).unwrap();

    assert_eq!(decision.decision, Verdict::Blocked);
    assert_eq!(decision.blockers, vec![Blocker::RarCompressed]);
    assert_eq!(summary.blocker_counts.get("rar-compressed"), Some(&1));
}

#[tokio::test]
async fn unpublished_release_is_blocked_for_missing_articles() {
    let server = FakeNntpServer::start().await;
    let (nzb, _) = rar_release("Taken.Down", 2, 3);

    let summary = completed(engine_for(&server).triage(&[nzb.into_bytes()]).await);
    let decision = summary.decision(0).unwrap();

    assert_eq!(decision.decision, Verdict::Blocked);
    assert!(decision.blockers.contains(&Blocker::MissingArticles));
    assert!(summary.metrics.stat_missing > 0);
}

#[tokio::test]
async fn shared_pool_reuses_sessions_across_calls() {
    let server = FakeNntpServer::start().await;
    let (nzb, names) = rar_release("Repeat.Me", 1, 2);
    publish_release(&server, &names, 2, &rar4_volume_head("movie.mkv", 0x30));
    let payloads = vec![nzb.into_bytes()];

    let engine = TriageEngine::from_config(TriageConfig {
        server: Some(server.server_config()),
        max_connections: 1,
        ..TriageConfig::default()
    });
    let pool = engine.build_shared_pool().unwrap();
    let engine = engine.with_shared_pool(pool.clone());

    let first = completed(engine.triage(&payloads).await);
    let second = completed(engine.triage(&payloads).await);

    assert_eq!(first.metrics.pool_creates, 1);
    assert_eq!(second.metrics.pool_creates, 0);
    assert!(second.metrics.pool_reuses > 0);
    assert_eq!(server.connections(), 1);

    pool.close_all().await;
    assert!(pool.is_closed());
}
