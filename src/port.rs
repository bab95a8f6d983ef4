// ============================================================================
// src/port.rs - Root Port Reset Control
// ============================================================================
//!
//! # ルートポート制御
//!
//! ルートポートのリセットシーケンスを駆動し、ハードウェアが確認する
//! 完了を有限ポーリングで待ち、チェンジラッチをクリアしてポートを
//! 有効化する。ハブダウンストリームポートの同形のシーケンスは
//! `hub` モジュール側（ハブのコントロールパイプ経由）。

use log::{error, warn};

use crate::status::{PortFeature, PortStatusBits};
use crate::{HostController, TimerOps};

// ============================================================================
// Timing Constants
// ============================================================================

/// リセット前のポート安定化待ち（マイクロ秒）
const ROOT_PORT_STABLE_STALL_US: u32 = 200_000;

/// リセット信号の最低駆動時間（USB 2.0 仕様 7.1.7.5、マイクロ秒）
pub(crate) const SET_PORT_RESET_STALL_US: u32 = 50_000;

/// リセット解除後のセトリング待ち（マイクロ秒）
pub(crate) const CLR_PORT_RESET_STALL_US: u32 = 20_000;

/// リセットビットクリア待ちポーリングの上限回数
pub(crate) const WAIT_PORT_STS_CHANGE_LOOP: usize = 10;

/// ポーリング1回あたりの待ち（マイクロ秒）
pub(crate) const WAIT_PORT_STS_CHANGE_STALL_US: u32 = 1_000;

/// リトライ1回ごとのバックオフ単位（マイクロ秒）
const PORT_RESET_RETRY_BACKOFF_US: u32 = 50_000;

// ============================================================================
// Root Port Reset
// ============================================================================

/// ルートポートにリセット信号を送り、安定化させる
///
/// ホストコントローラはリセットが実際に完了するまで RESET ビットを
/// クリアしない。有限ループ内に完了が観測できない場合は警告のみで
/// 処理を続ける（以降の状態読み出しが実態を反映する）。
/// `retry_index` に応じて復帰前のバックオフが伸びる。
pub(crate) fn reset_root_port<C: HostController, T: TimerOps>(
    hc: &mut C,
    timer: &mut T,
    port: u8,
    retry_index: u8,
) {
    timer.delay_us(ROOT_PORT_STABLE_STALL_US);

    // リセット信号をアサート
    if let Err(e) = hc.set_port_feature(port, PortFeature::Reset) {
        error!("port {}: set PORT_RESET failed: {}", port, e);
        return;
    }

    timer.delay_us(SET_PORT_RESET_STALL_US);

    // リセット信号をデアサート
    if let Err(e) = hc.clear_port_feature(port, PortFeature::Reset) {
        error!("port {}: clear PORT_RESET failed: {}", port, e);
        return;
    }

    timer.delay_us(CLR_PORT_RESET_STALL_US);

    // ハードウェアによる完了確認を有限ループで待つ
    let mut finished = false;
    for _ in 0..WAIT_PORT_STS_CHANGE_LOOP {
        match hc.port_status(port) {
            Ok(st) => {
                if !st.status.contains(PortStatusBits::RESET) {
                    finished = true;
                    break;
                }
            }
            Err(e) => {
                error!("port {}: status read during reset failed: {}", port, e);
                return;
            }
        }
        timer.delay_us(WAIT_PORT_STS_CHANGE_STALL_US);
    }

    if !finished {
        warn!("port {}: reset not finished in time", port);
        return;
    }

    let _ = hc.clear_port_feature(port, PortFeature::ResetChange);
    let _ = hc.clear_port_feature(port, PortFeature::ConnectChange);

    // ポートを明示的に有効化
    let _ = hc.set_port_feature(port, PortFeature::Enable);
    let _ = hc.clear_port_feature(port, PortFeature::EnableChange);

    timer.delay_us((retry_index as u32 + 1) * PORT_RESET_RETRY_BACKOFF_US);
}
