// ============================================================================
// src/status.rs - Port Status and Feature Selectors
// ============================================================================
//!
//! # ポートステータス
//!
//! USB標準のポートステータス/チェンジワード（各16ビット）のビット厳密な
//! 表現と、ポートフィーチャーセレクタの定義。
//! ルートポートとハブダウンストリームポートで同一のレイアウトを使う。

use bitflags::bitflags;

use crate::UsbSpeed;

bitflags! {
    /// ポートステータスワード (wPortStatus)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatusBits: u16 {
        /// 接続中
        const CONNECTION = 0x0001;
        /// 有効
        const ENABLE = 0x0002;
        /// サスペンド中
        const SUSPEND = 0x0004;
        /// オーバーカレント
        const OVERCURRENT = 0x0008;
        /// リセット進行中
        const RESET = 0x0010;
        /// 電源供給中
        const POWER = 0x0100;
        /// Low Speed デバイス接続
        const LOW_SPEED = 0x0200;
        /// High Speed デバイス接続
        const HIGH_SPEED = 0x0400;
        /// Super Speed デバイス接続
        const SUPER_SPEED = 0x0800;
    }
}

bitflags! {
    /// ポートチェンジワード (wPortChange)
    ///
    /// 前回クリア以降に対応ステータスが変化したことを示すラッチビット。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortChangeBits: u16 {
        /// 接続変化
        const C_CONNECTION = 0x0001;
        /// 有効変化
        const C_ENABLE = 0x0002;
        /// サスペンド変化
        const C_SUSPEND = 0x0004;
        /// オーバーカレント変化
        const C_OVERCURRENT = 0x0008;
        /// リセット完了
        const C_RESET = 0x0010;
    }
}

impl PortChangeBits {
    /// 列挙対象となる変化（接続/有効/オーバーカレント/リセット）
    pub const RELEVANT: Self = Self::C_CONNECTION
        .union(Self::C_ENABLE)
        .union(Self::C_OVERCURRENT)
        .union(Self::C_RESET);
}

// ============================================================================
// Port Status Snapshot
// ============================================================================

/// ポートステータススナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    /// 現在のステータスビット
    pub status: PortStatusBits,
    /// ラッチされたチェンジビット
    pub change: PortChangeBits,
}

impl PortStatus {
    /// 生の16ビットワード対から構築（未知ビットは捨てる）
    pub fn from_raw(status: u16, change: u16) -> Self {
        Self {
            status: PortStatusBits::from_bits_truncate(status),
            change: PortChangeBits::from_bits_truncate(change),
        }
    }

    /// デバイス接続中か
    pub fn is_connected(&self) -> bool {
        self.status.contains(PortStatusBits::CONNECTION)
    }

    /// ポート有効か
    pub fn is_enabled(&self) -> bool {
        self.status.contains(PortStatusBits::ENABLE)
    }

    /// 列挙対象の変化がラッチされているか
    pub fn has_relevant_change(&self) -> bool {
        self.change.intersects(PortChangeBits::RELEVANT)
    }

    /// ステータスの速度ビットからデバイス速度を導出
    ///
    /// 速度ビットが立っていない場合は Full Speed。
    pub fn speed(&self) -> UsbSpeed {
        if self.status.contains(PortStatusBits::SUPER_SPEED) {
            UsbSpeed::Super
        } else if self.status.contains(PortStatusBits::HIGH_SPEED) {
            UsbSpeed::High
        } else if self.status.contains(PortStatusBits::LOW_SPEED) {
            UsbSpeed::Low
        } else {
            UsbSpeed::Full
        }
    }
}

// ============================================================================
// Port Feature Selectors
// ============================================================================

/// ポートフィーチャーセレクタ
///
/// 値はUSBハブクラス仕様のフィーチャーセレクタ番号と一致する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PortFeature {
    /// Port Connection
    Connection = 0,
    /// Port Enable
    Enable = 1,
    /// Port Suspend
    Suspend = 2,
    /// Port Over-current
    OverCurrent = 3,
    /// Port Reset
    Reset = 4,
    /// Port Power
    Power = 8,
    /// Port Low Speed
    LowSpeed = 9,
    /// Connect Change
    ConnectChange = 16,
    /// Enable Change
    EnableChange = 17,
    /// Suspend Change
    SuspendChange = 18,
    /// Over-current Change
    OverCurrentChange = 19,
    /// Reset Change
    ResetChange = 20,
}

impl PortFeature {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}
