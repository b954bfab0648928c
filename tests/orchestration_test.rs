//! 编排核心集成测试
//!
//! 覆盖依赖门控、下载-解包流水线、两阶段提现与结算服务连通性。

mod common;

use std::time::Duration;

use common::*;
use drivecore::domain::lifecycle::ChainStatus;
use drivecore::error::AppErrorCode;
use drivecore::infrastructure::event_bus::OrchestratorEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 依赖门控场景
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn start_with_missing_dependency_is_refused() {
    let env = test_state("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let state = &env.state;

    // thunder 依赖 enforcer，enforcer 还是 not_downloaded
    for status in [
        ChainStatus::Downloading,
        ChainStatus::Extracting,
        ChainStatus::Downloaded,
    ] {
        state.store.transition("thunder", status).await.unwrap();
    }

    let err = state.supervisor.start("thunder", vec![]).await.unwrap_err();
    assert_eq!(err.code, AppErrorCode::MissingDependencies);
    assert_eq!(err.details.unwrap()["missing"][0], "enforcer");

    // thunder 状态保持不变
    assert_eq!(
        state.store.status("thunder").await.unwrap(),
        ChainStatus::Downloaded
    );
}

#[tokio::test]
async fn stop_with_running_dependent_requires_force() {
    let env = test_state("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let state = &env.state;

    drive_to_running(state, "bitcoin").await;
    drive_to_running(state, "enforcer").await;
    drive_to_running(state, "thunder").await;

    let err = state.supervisor.stop("enforcer", false).await.unwrap_err();
    assert_eq!(err.code, AppErrorCode::BlockedByDependents);
    assert_eq!(err.details.unwrap()["dependents"][0], "thunder");

    // force=true：enforcer 走到 stopped，thunder 保持 running（不级联）
    state.supervisor.stop("enforcer", true).await.unwrap();
    assert_eq!(
        state.store.status("enforcer").await.unwrap(),
        ChainStatus::Stopped
    );
    assert_eq!(
        state.store.status("thunder").await.unwrap(),
        ChainStatus::Running
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 下载-解包流水线
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn download_extract_pipeline_reaches_downloaded() {
    let archive = make_release_archive("thunder", b"#!/bin/sh\nsleep 0.3\n");
    let release_url = mock_release_server(archive).await;
    let env = test_state("http://127.0.0.1:1", &release_url).await;
    let state = &env.state;

    let mut events = state.events.subscribe();

    state.downloads.start("thunder").await.unwrap();

    assert!(
        wait_for_status(state, "thunder", ChainStatus::Downloaded, Duration::from_secs(10)).await,
        "download did not reach downloaded state"
    );

    // 解包后的二进制在预期路径
    let binary = state
        .registry
        .get("thunder")
        .unwrap()
        .binary_path(&state.config.paths.base_dir);
    assert!(binary.exists());

    // 事件流里进度单调不减，且出现 started/complete
    let mut saw_started = false;
    let mut saw_complete = false;
    let mut last_percent = 0u8;
    while let Ok(envelope) = events.try_recv() {
        match envelope.event {
            OrchestratorEvent::DownloadStarted { ref chain_id } if chain_id == "thunder" => {
                saw_started = true;
            }
            OrchestratorEvent::DownloadProgress { percent, .. } => {
                assert!(percent >= last_percent, "progress went backwards");
                last_percent = percent;
            }
            OrchestratorEvent::DownloadComplete { ref chain_id } if chain_id == "thunder" => {
                saw_complete = true;
            }
            _ => {}
        }
    }
    assert!(saw_started);
    assert!(saw_complete);
}

#[tokio::test]
async fn corrupt_archive_forces_full_redownload() {
    // 归档不是合法 gzip：解包失败
    let release_url = mock_release_server(b"definitely not a tar.gz".to_vec()).await;
    let env = test_state("http://127.0.0.1:1", &release_url).await;
    let state = &env.state;

    let mut events = state.events.subscribe();

    state.downloads.start("bitnames").await.unwrap();

    assert!(
        wait_for_status(
            state,
            "bitnames",
            ChainStatus::NotDownloaded,
            Duration::from_secs(10)
        )
        .await,
        "corrupt download did not return to not_downloaded"
    );

    let mut saw_failure = false;
    while let Ok(envelope) = events.try_recv() {
        if let OrchestratorEvent::DownloadFailed {
            ref chain_id,
            ref code,
            ref reason,
        } = envelope.event
        {
            if chain_id == "bitnames" {
                saw_failure = true;
                // 结构化错误码区分归档损坏与瞬态网络失败
                assert_eq!(code, "download_corrupt");
                assert!(reason.to_lowercase().contains("corrupt"));
            }
        }
    }
    assert!(saw_failure);

    // 失败后可以从头重新下载
    state.downloads.start("bitnames").await.unwrap();
}

#[tokio::test]
async fn pause_then_resume_continues_from_byte_offset() {
    // 100KB 弱可压缩内容 + 节流服务器：传输足够慢，可在中途暂停
    let archive = make_release_archive("thunder", &pseudo_random_bytes(100_000));
    let (release_url, mock) = mock_throttled_release_server(archive).await;
    let env = test_state("http://127.0.0.1:1", &release_url).await;
    let state = &env.state;

    let mut events = state.events.subscribe();
    state.downloads.start("thunder").await.unwrap();

    // 等第一个进度事件，确认字节已开始流动
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut saw_progress = false;
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(envelope)) => {
                if matches!(envelope.event, OrchestratorEvent::DownloadProgress { .. }) {
                    saw_progress = true;
                    break;
                }
            }
            _ => continue,
        }
    }
    assert!(saw_progress, "no download progress observed");

    // 暂停：字节停止传输，状态保持 downloading
    state.downloads.pause("thunder").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let paused_at = {
        let downloads = state.downloads.list_active().await;
        let info = downloads.iter().find(|d| d.chain_id == "thunder").unwrap();
        assert!(info.paused);
        assert!(info.received_bytes > 0);
        info.received_bytes
    };
    assert_eq!(
        state.store.status("thunder").await.unwrap(),
        ChainStatus::Downloading
    );

    // 暂停期间接收字节数不再前进
    tokio::time::sleep(Duration::from_millis(300)).await;
    let still = state.downloads.list_active().await;
    let info = still.iter().find(|d| d.chain_id == "thunder").unwrap();
    assert_eq!(info.received_bytes, paused_at);

    // 恢复：从上次偏移继续，最终完成
    state.downloads.resume("thunder").await.unwrap();
    assert!(
        wait_for_status(state, "thunder", ChainStatus::Downloaded, Duration::from_secs(30)).await,
        "resumed download did not complete"
    );

    // 服务器恰好收到两个请求：首个无 Range，恢复请求从暂停偏移续传
    let offsets = mock.range_offsets.lock().unwrap().clone();
    assert_eq!(offsets.len(), 2, "expected exactly initial + resume requests");
    assert_eq!(offsets[0], None);
    assert_eq!(offsets[1], Some(paused_at));
}

#[tokio::test]
async fn duplicate_download_is_already_in_progress() {
    // 不可路由地址：连接挂起，任务保持活跃，足够验证重复下载被拒
    let env = test_state("http://127.0.0.1:1", "http://10.255.255.1:9").await;
    let state = &env.state;

    state.downloads.start("zside").await.unwrap();
    let err = state.downloads.start("zside").await.unwrap_err();
    assert_eq!(err.code, AppErrorCode::AlreadyInProgress);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 进程监督（真实子进程）
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(unix)]
#[tokio::test]
async fn spawn_and_stop_real_process() {
    use std::os::unix::fs::PermissionsExt;

    let env = test_state("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let state = &env.state;

    drive_to_running(state, "bitcoin").await;

    // 放置一个真实可执行脚本充当 enforcer 二进制
    let def = state.registry.get("enforcer").unwrap();
    let binary = def.binary_path(&state.config.paths.base_dir);
    std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
    std::fs::write(&binary, "#!/bin/sh\necho enforcer-online\nsleep 0.5\n").unwrap();
    std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    for status in [
        ChainStatus::Downloading,
        ChainStatus::Extracting,
        ChainStatus::Downloaded,
    ] {
        state.store.transition("enforcer", status).await.unwrap();
    }

    let mut events = state.events.subscribe();
    state.supervisor.start("enforcer", vec![]).await.unwrap();
    assert_eq!(
        state.store.status("enforcer").await.unwrap(),
        ChainStatus::Starting
    );

    // 子进程 stdout 被转发为 ChainLog 事件
    let mut saw_log = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(envelope)) => {
                if let OrchestratorEvent::ChainLog { ref chain_id, ref line } = envelope.event {
                    if chain_id == "enforcer" && line.contains("enforcer-online") {
                        saw_log = true;
                        break;
                    }
                }
            }
            _ => continue,
        }
    }
    assert!(saw_log, "chain log was not forwarded");

    // 停止必须最终到达 stopped
    state.supervisor.stop("enforcer", false).await.unwrap();
    assert_eq!(
        state.store.status("enforcer").await.unwrap(),
        ChainStatus::Stopped
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 重置
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn reset_wipes_chain_directories() {
    let archive = make_release_archive("thunder", b"#!/bin/sh\ntrue\n");
    let release_url = mock_release_server(archive).await;
    let env = test_state("http://127.0.0.1:1", &release_url).await;
    let state = &env.state;

    state.downloads.start("thunder").await.unwrap();
    assert!(
        wait_for_status(state, "thunder", ChainStatus::Downloaded, Duration::from_secs(10)).await
    );

    let binary = state
        .registry
        .get("thunder")
        .unwrap()
        .binary_path(&state.config.paths.base_dir);
    assert!(binary.exists());

    state.reset_chain("thunder").await.unwrap();
    assert_eq!(
        state.store.status("thunder").await.unwrap(),
        ChainStatus::NotDownloaded
    );
    assert!(!binary.exists());
}

#[tokio::test]
async fn reset_mid_download_is_rejected() {
    // 不可路由地址：下载保持在 downloading 过渡态
    let env = test_state("http://127.0.0.1:1", "http://10.255.255.1:9").await;
    let state = &env.state;

    state.downloads.start("thunder").await.unwrap();
    let err = state.reset_chain("thunder").await.unwrap_err();
    assert_eq!(err.code, AppErrorCode::StateConflict);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 两阶段提现（模拟结算服务）
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn withdrawal_two_phase_flow_with_idempotent_completion() {
    let (settlement_url, mock) = mock_settlement_server().await;
    let env = test_state(&settlement_url, "http://127.0.0.1:1").await;
    let state = &env.state;

    // 阶段一：1.5 币 + 2000 聪 = 1.50002
    let receipt = state
        .withdrawals
        .request_withdrawal("tb1qdestination", 1.5, "Thunder")
        .await
        .unwrap();
    assert_eq!(receipt.hash, "test-withdrawal-hash");
    assert_eq!(receipt.server_l2_address, "l2-server-address");
    assert!((receipt.total_amount - 1.50002).abs() < 1e-9);

    let stored = state.withdrawals.get(&receipt.hash).await.unwrap();
    assert_eq!(stored.status.as_str(), "payment_pending");

    // 阶段二
    let message = state
        .withdrawals
        .notify_payment_complete(&receipt.hash, "l2-txid-1")
        .await
        .unwrap();
    assert_eq!(message.message, "Withdrawal paid out on L1");

    // 同一 (hash, txid) 重复提交：幂等，不再打到结算服务
    let replay = state
        .withdrawals
        .notify_payment_complete(&receipt.hash, "l2-txid-1")
        .await
        .unwrap();
    assert_eq!(replay.message, message.message);
    assert_eq!(
        mock.complete_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    // 不同 txid 的重复完成是冲突
    let err = state
        .withdrawals
        .notify_payment_complete(&receipt.hash, "other-txid")
        .await
        .unwrap_err();
    assert_eq!(err.code, AppErrorCode::StateConflict);
}

#[tokio::test]
async fn withdrawal_validation_precedes_network() {
    // 结算端点不可达也无妨：本地校验先行
    let env = test_state("http://127.0.0.1:1", "http://127.0.0.1:1").await;
    let state = &env.state;

    let err = state
        .withdrawals
        .request_withdrawal("tb1qdest", 0.0, "Thunder")
        .await
        .unwrap_err();
    assert_eq!(err.code, AppErrorCode::InvalidAmount);

    let err = state
        .withdrawals
        .request_withdrawal("", 1.0, "Thunder")
        .await
        .unwrap_err();
    assert_eq!(err.code, AppErrorCode::InvalidAddress);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 结算服务连通性
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn settlement_connectivity_and_block_count() {
    let (settlement_url, _mock) = mock_settlement_server().await;
    let env = test_state(&settlement_url, "http://127.0.0.1:1").await;
    let state = &env.state;

    state.settlement.wait_for_connection(5).await.unwrap();
    assert_eq!(state.settlement.block_count().await.unwrap(), 4242);

    // 运行中的 bitcoin 经由结算服务取实时高度
    drive_to_running(&env.state, "bitcoin").await;
    assert_eq!(state.chain_block_count("bitcoin").await.unwrap(), 4242);

    // 没有高度端点的链直接拒绝
    let err = state.chain_block_count("enforcer").await.unwrap_err();
    assert_eq!(err.code, AppErrorCode::ChainNotSupported);
}
