// ============================================================================
// src/lib.rs - USB Bus Enumeration Engine
// ============================================================================
//!
//! # USBバス列挙エンジン
//!
//! OS本体のUSBスタックが立ち上がる前（ブート初期段階）に、ホストコントローラ
//! 配下のUSBデバイスを検出・アドレス割り当て・構成するエンジン。
//! ハブ配下のデバイスも深さ優先で再帰的に走査する。
//!
//! ## アーキテクチャ
//! - ホストコントローラとタイマーはトレイトとして注入（実装はプラットフォーム側）
//! - ディスクリプタ走査 → デバイス構成 → ポート制御 → ツリー走査の層構造
//! - 構成済みデバイスはレジストリへ公開され、ハンドル経由で転送操作を提供
//!
//! ## 型安全性
//! - Newtype パターンによるアドレス/ハンドル管理
//! - ポートステータスは bitflags によるビット厳密表現

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod descriptor;
pub mod device;
pub mod enumeration;
pub mod error;
pub mod hub;
pub mod port;
pub mod registry;
pub mod status;

pub use enumeration::UsbBus;
pub use error::{UsbBusError, UsbBusResult};
pub use registry::{DeviceHandle, DeviceRegistry};
pub use status::{PortChangeBits, PortFeature, PortStatus, PortStatusBits};

// ============================================================================
// USB Speed
// ============================================================================

/// USB 速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Low Speed (1.5 Mbps)
    Low,
    /// Full Speed (12 Mbps)
    Full,
    /// High Speed (480 Mbps)
    High,
    /// Super Speed (5 Gbps)
    Super,
}

impl UsbSpeed {
    /// コントロールエンドポイントの既定最大パケットサイズ
    ///
    /// デバイスディスクリプタ取得前に使う初期値。取得後は
    /// 報告された値で上書きされる。
    pub fn default_max_packet_size(&self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
            UsbSpeed::Super => 512,
        }
    }
}

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// USBデバイスアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(pub u8);

impl DeviceAddress {
    pub const UNASSIGNED: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0 && self.0 <= 127
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

// ============================================================================
// Transaction Translator
// ============================================================================

/// トランザクショントランスレータ
///
/// High Speed ハブ配下に Low/Full Speed デバイスがぶら下がる場合に、
/// そのハブのアドレスとポート番号で識別される変換点。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translator {
    /// 変換を行うハブのアドレス
    pub hub_address: DeviceAddress,
    /// ハブ上のポートインデックス
    pub port: u8,
}

// ============================================================================
// Transfer Route
// ============================================================================

/// 転送ルート
///
/// ホストコントローラが1回の転送を実行するのに必要なデバイス側の情報。
/// 各転送時に `DeviceNode` の現在値から組み立てられる。
#[derive(Debug, Clone, Copy)]
pub struct TransferRoute {
    /// 宛先デバイスアドレス（未アドレス時は 0）
    pub address: DeviceAddress,
    /// デバイス速度
    pub speed: UsbSpeed,
    /// コントロールエンドポイント最大パケットサイズ
    pub max_packet_size: u16,
    /// トランザクショントランスレータ（High Speed デバイスでは None）
    pub translator: Option<Translator>,
}

// ============================================================================
// Standard Request Codes
// ============================================================================

/// USB標準リクエストコード
pub mod request {
    /// GET_STATUS
    pub const GET_STATUS: u8 = 0x00;
    /// CLEAR_FEATURE
    pub const CLEAR_FEATURE: u8 = 0x01;
    /// SET_FEATURE
    pub const SET_FEATURE: u8 = 0x03;
    /// SET_ADDRESS
    pub const SET_ADDRESS: u8 = 0x05;
    /// GET_DESCRIPTOR
    pub const GET_DESCRIPTOR: u8 = 0x06;
    /// SET_CONFIGURATION
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// 文字列ディスクリプタの言語ID（英語/US）
pub const LANG_ID_ENGLISH_US: u16 = 0x0409;

// ============================================================================
// USB Setup Packet
// ============================================================================

/// USBセットアップパケット (8バイト)
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SetupPacket {
    /// リクエストタイプ
    pub bm_request_type: u8,
    /// リクエスト
    pub b_request: u8,
    /// 値
    pub w_value: u16,
    /// インデックス
    pub w_index: u16,
    /// 長さ
    pub w_length: u16,
}

impl SetupPacket {
    /// GET_DESCRIPTOR リクエスト
    pub fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        Self {
            bm_request_type: 0x80, // Device-to-host, Standard, Device
            b_request: request::GET_DESCRIPTOR,
            w_value: ((desc_type as u16) << 8) | (desc_index as u16),
            w_index: 0,
            w_length: length,
        }
    }

    /// 文字列ディスクリプタ用 GET_DESCRIPTOR リクエスト（言語ID指定）
    pub fn get_string_descriptor(desc_index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            bm_request_type: 0x80,
            b_request: request::GET_DESCRIPTOR,
            w_value: ((descriptor::descriptor_type::STRING as u16) << 8) | (desc_index as u16),
            w_index: lang_id,
            w_length: length,
        }
    }

    /// SET_ADDRESS リクエスト
    pub fn set_address(address: DeviceAddress) -> Self {
        Self {
            bm_request_type: 0x00, // Host-to-device, Standard, Device
            b_request: request::SET_ADDRESS,
            w_value: address.as_u8() as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// SET_CONFIGURATION リクエスト
    pub fn set_configuration(config: u8) -> Self {
        Self {
            bm_request_type: 0x00,
            b_request: request::SET_CONFIGURATION,
            w_value: config as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// クラス固有のリクエスト
    pub fn class_request(
        direction_in: bool,
        recipient: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let bm_request_type =
            (if direction_in { 0x80 } else { 0x00 }) |  // Direction
            0x20 |                                       // Class
            (recipient & 0x1F); // Recipient

        Self {
            bm_request_type,
            b_request: request,
            w_value: value,
            w_index: index,
            w_length: length,
        }
    }
}

// ============================================================================
// Capability Traits
// ============================================================================

/// ホストコントローラ能力
///
/// ルートポートの状態操作とデバイス転送の実行を提供する。
/// レガシー/拡張コントローラの違いは実装側に閉じ、列挙アルゴリズムは
/// このトレイトに対してのみ書かれる。
pub trait HostController {
    /// ルートポート数を取得
    fn port_count(&mut self) -> u8;

    /// ルートポートのステータススナップショットを取得
    fn port_status(&mut self, port: u8) -> UsbBusResult<PortStatus>;

    /// ルートポートフィーチャーを設定
    fn set_port_feature(&mut self, port: u8, feature: PortFeature) -> UsbBusResult<()>;

    /// ルートポートフィーチャーをクリア
    fn clear_port_feature(&mut self, port: u8, feature: PortFeature) -> UsbBusResult<()>;

    /// コントロール転送を実行
    ///
    /// `data` が `Some` の場合、IN転送では受信データが書き込まれる。
    /// 戻り値は転送されたバイト数。
    fn control_transfer(
        &mut self,
        route: &TransferRoute,
        setup: &SetupPacket,
        data: Option<&mut [u8]>,
    ) -> UsbBusResult<usize>;

    /// バルク転送を実行
    ///
    /// `toggle` は呼び出し側が保持するデータトグルビット。転送完了後の
    /// 値に更新される。
    fn bulk_transfer(
        &mut self,
        route: &TransferRoute,
        endpoint: u8,
        toggle: &mut u8,
        data: &mut [u8],
    ) -> UsbBusResult<usize>;
}

/// タイマー能力
///
/// ポートリセットやアドレス設定後のセトリング待ちに使う遅延プリミティブ。
pub trait TimerOps {
    /// マイクロ秒単位の遅延
    fn delay_us(&mut self, us: u32);
}

/// 構成済みデバイス1台ごとに呼ばれる通知コールバック
pub type DeviceCallback<'a> = dyn FnMut(DeviceHandle) + 'a;
