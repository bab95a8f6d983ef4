// ============================================================================
// src/error.rs - Unified Error Type
// ============================================================================
//!
//! # 統一エラー型
//!
//! バス列挙全体で使用される統一エラー型を定義する。
//! 分類は伝播ポリシーと対応する:
//! - デバイス単位のエラーはそのポートをスキップして列挙を継続
//! - リソース枯渇と公開後のハブ構成失敗のみが列挙全体を中断

use core::fmt;

/// バス列挙の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbBusError {
    /// メモリ/ノード割り当て失敗（列挙全体を中断）
    ResourceExhausted,
    /// デバイス側の不正（ディスクリプタ破損、長さ/型不一致など。
    /// 当該デバイスの構成のみ中断）
    DeviceError,
    /// 転送がハードウェア/トランスポート層で失敗
    TransportFailure,
    /// 呼び出し側の引数不正（無効なハンドルなど）
    InvalidArgument,
    /// 有限ポーリングループが確認を得られず満了
    Timeout,
}

impl fmt::Display for UsbBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbBusError::ResourceExhausted => write!(f, "resource exhausted"),
            UsbBusError::DeviceError => write!(f, "device error"),
            UsbBusError::TransportFailure => write!(f, "transport failure"),
            UsbBusError::InvalidArgument => write!(f, "invalid argument"),
            UsbBusError::Timeout => write!(f, "timeout"),
        }
    }
}

pub type UsbBusResult<T> = Result<T, UsbBusError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_display_messages() {
        assert_eq!(format!("{}", UsbBusError::DeviceError), "device error");
        assert_eq!(format!("{}", UsbBusError::Timeout), "timeout");
    }
}
