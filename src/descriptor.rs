// ============================================================================
// src/descriptor.rs - USB Descriptors and Descriptor Scanner
// ============================================================================
//!
//! # USB ディスクリプタ
//!
//! USBデバイスの構成を記述するディスクリプタの定義と、
//! デバイスから受信した生バイトバッファの走査。
//!
//! ## 型安全性
//! - SafePackedRead による安全なパック構造体アクセス
//! - 走査は長さ検査により敵対的バッファでも必ず停止する

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{UsbBusError, UsbBusResult};

// ============================================================================
// Descriptor Types
// ============================================================================

/// ディスクリプタタイプコード
pub mod descriptor_type {
    /// デバイスディスクリプタ
    pub const DEVICE: u8 = 1;
    /// コンフィグレーションディスクリプタ
    pub const CONFIGURATION: u8 = 2;
    /// 文字列ディスクリプタ
    pub const STRING: u8 = 3;
    /// インターフェースディスクリプタ
    pub const INTERFACE: u8 = 4;
    /// エンドポイントディスクリプタ
    pub const ENDPOINT: u8 = 5;
    /// ハブディスクリプタ（クラス固有）
    pub const HUB: u8 = 0x29;
}

/// USBクラスコード
pub mod class_code {
    pub const AUDIO: u8 = 0x01;
    pub const CDC: u8 = 0x02;
    pub const HID: u8 = 0x03;
    pub const MASS_STORAGE: u8 = 0x08;
    pub const HUB: u8 = 0x09;
    pub const VENDOR_SPECIFIC: u8 = 0xFF;
}

// ============================================================================
// Safe Packed Read Trait
// ============================================================================

/// パック構造体の安全な読み取りトレイト
pub trait SafePackedRead: Sized {
    /// バイト配列から構造体を作成
    fn from_bytes(data: &[u8]) -> Option<Self>;
}

/// フィールドの安全な読み取りマクロ
macro_rules! read_field {
    ($ptr:expr, $field:ident) => {{
        let field_ptr = unsafe { core::ptr::addr_of!((*$ptr).$field) };
        unsafe { core::ptr::read_unaligned(field_ptr) }
    }};
}

// ============================================================================
// Device Descriptor
// ============================================================================

/// デバイスディスクリプタ (18バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DeviceDescriptor {
    /// 長さ (18)
    pub b_length: u8,
    /// タイプ (1)
    pub b_descriptor_type: u8,
    /// USB仕様バージョン (BCD)
    pub bcd_usb: u16,
    /// デバイスクラス
    pub b_device_class: u8,
    /// デバイスサブクラス
    pub b_device_sub_class: u8,
    /// デバイスプロトコル
    pub b_device_protocol: u8,
    /// 最大パケットサイズ (EP0)
    pub b_max_packet_size0: u8,
    /// ベンダーID
    pub id_vendor: u16,
    /// プロダクトID
    pub id_product: u16,
    /// デバイスバージョン (BCD)
    pub bcd_device: u16,
    /// 製造者文字列インデックス
    pub i_manufacturer: u8,
    /// 製品文字列インデックス
    pub i_product: u8,
    /// シリアル番号文字列インデックス
    pub i_serial_number: u8,
    /// コンフィグレーション数
    pub b_num_configurations: u8,
}

impl SafePackedRead for DeviceDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 18 {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            bcd_usb: read_field!(ptr, bcd_usb),
            b_device_class: read_field!(ptr, b_device_class),
            b_device_sub_class: read_field!(ptr, b_device_sub_class),
            b_device_protocol: read_field!(ptr, b_device_protocol),
            b_max_packet_size0: read_field!(ptr, b_max_packet_size0),
            id_vendor: read_field!(ptr, id_vendor),
            id_product: read_field!(ptr, id_product),
            bcd_device: read_field!(ptr, bcd_device),
            i_manufacturer: read_field!(ptr, i_manufacturer),
            i_product: read_field!(ptr, i_product),
            i_serial_number: read_field!(ptr, i_serial_number),
            b_num_configurations: read_field!(ptr, b_num_configurations),
        })
    }
}

// ============================================================================
// Configuration Descriptor
// ============================================================================

/// コンフィグレーションディスクリプタ (9バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct ConfigurationDescriptor {
    /// 長さ (9)
    pub b_length: u8,
    /// タイプ (2)
    pub b_descriptor_type: u8,
    /// 合計長さ
    pub w_total_length: u16,
    /// インターフェース数
    pub b_num_interfaces: u8,
    /// コンフィグレーション値
    pub b_configuration_value: u8,
    /// コンフィグレーション文字列インデックス
    pub i_configuration: u8,
    /// 属性
    pub bm_attributes: u8,
    /// 最大電力 (2mA単位)
    pub b_max_power: u8,
}

/// コンフィグレーションディスクリプタのサイズ
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;

impl SafePackedRead for ConfigurationDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < CONFIG_DESCRIPTOR_SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            w_total_length: read_field!(ptr, w_total_length),
            b_num_interfaces: read_field!(ptr, b_num_interfaces),
            b_configuration_value: read_field!(ptr, b_configuration_value),
            i_configuration: read_field!(ptr, i_configuration),
            bm_attributes: read_field!(ptr, bm_attributes),
            b_max_power: read_field!(ptr, b_max_power),
        })
    }
}

// ============================================================================
// Interface Descriptor
// ============================================================================

/// インターフェースディスクリプタ (9バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct InterfaceDescriptor {
    /// 長さ (9)
    pub b_length: u8,
    /// タイプ (4)
    pub b_descriptor_type: u8,
    /// インターフェース番号
    pub b_interface_number: u8,
    /// 代替設定
    pub b_alternate_setting: u8,
    /// エンドポイント数
    pub b_num_endpoints: u8,
    /// インターフェースクラス
    pub b_interface_class: u8,
    /// インターフェースサブクラス
    pub b_interface_sub_class: u8,
    /// インターフェースプロトコル
    pub b_interface_protocol: u8,
    /// インターフェース文字列インデックス
    pub i_interface: u8,
}

/// インターフェースディスクリプタのサイズ
pub const INTERFACE_DESCRIPTOR_SIZE: usize = 9;

impl SafePackedRead for InterfaceDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < INTERFACE_DESCRIPTOR_SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            b_interface_number: read_field!(ptr, b_interface_number),
            b_alternate_setting: read_field!(ptr, b_alternate_setting),
            b_num_endpoints: read_field!(ptr, b_num_endpoints),
            b_interface_class: read_field!(ptr, b_interface_class),
            b_interface_sub_class: read_field!(ptr, b_interface_sub_class),
            b_interface_protocol: read_field!(ptr, b_interface_protocol),
            i_interface: read_field!(ptr, i_interface),
        })
    }
}

// ============================================================================
// Endpoint Descriptor
// ============================================================================

/// エンドポイントディスクリプタ (7バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct EndpointDescriptor {
    /// 長さ (7)
    pub b_length: u8,
    /// タイプ (5)
    pub b_descriptor_type: u8,
    /// エンドポイントアドレス
    pub b_endpoint_address: u8,
    /// 属性
    pub bm_attributes: u8,
    /// 最大パケットサイズ
    pub w_max_packet_size: u16,
    /// ポーリング間隔
    pub b_interval: u8,
}

/// エンドポイントディスクリプタのサイズ
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 7;

impl SafePackedRead for EndpointDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ENDPOINT_DESCRIPTOR_SIZE {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_length: read_field!(ptr, b_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            b_endpoint_address: read_field!(ptr, b_endpoint_address),
            bm_attributes: read_field!(ptr, bm_attributes),
            w_max_packet_size: read_field!(ptr, w_max_packet_size),
            b_interval: read_field!(ptr, b_interval),
        })
    }
}

impl EndpointDescriptor {
    /// エンドポイント番号
    pub fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    /// IN方向?
    pub fn is_in(&self) -> bool {
        (self.b_endpoint_address & 0x80) != 0
    }
}

// ============================================================================
// Hub Descriptor
// ============================================================================

/// ハブディスクリプタ先頭部 (8バイト)
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct HubDescriptor {
    pub b_desc_length: u8,
    pub b_descriptor_type: u8,
    pub b_nbr_ports: u8,
    pub w_hub_characteristics: u16,
    pub b_pwr_on_2_pwr_good: u8,
    pub b_hub_contr_current: u8,
}

/// 取得するハブディスクリプタのバイト数
pub const HUB_DESCRIPTOR_SIZE: usize = 8;

impl SafePackedRead for HubDescriptor {
    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 7 {
            return None;
        }

        let ptr = data.as_ptr() as *const Self;
        Some(Self {
            b_desc_length: read_field!(ptr, b_desc_length),
            b_descriptor_type: read_field!(ptr, b_descriptor_type),
            b_nbr_ports: read_field!(ptr, b_nbr_ports),
            w_hub_characteristics: read_field!(ptr, w_hub_characteristics),
            b_pwr_on_2_pwr_good: read_field!(ptr, b_pwr_on_2_pwr_good),
            b_hub_contr_current: read_field!(ptr, b_hub_contr_current),
        })
    }
}

// ============================================================================
// String Descriptor
// ============================================================================

/// 文字列ディスクリプタをパース
///
/// UTF-16LEペイロードをデコードして返す。ヘッダ不正や長さ不足は None。
pub fn parse_string_descriptor(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }

    let length = data[0] as usize;
    if length < 2 || length > data.len() {
        return None;
    }

    if data[1] != descriptor_type::STRING {
        return None;
    }

    // UTF-16LEからUTF-8に変換
    let utf16_data = &data[2..length];
    let mut utf16_chars = Vec::new();

    for i in (0..utf16_data.len()).step_by(2) {
        if i + 1 < utf16_data.len() {
            let c = u16::from_le_bytes([utf16_data[i], utf16_data[i + 1]]);
            utf16_chars.push(c);
        }
    }

    String::from_utf16(&utf16_chars).ok()
}

// ============================================================================
// Descriptor Scanner
// ============================================================================

/// 期待するディスクリプタの開始位置を探す
///
/// バッファを左から右へ `{length:u8, type:u8, ...}` として解釈し、
/// (型, 長さ) ヘッダが `(wanted_type, wanted_len)` と厳密一致する最初の
/// ディスクリプタまでのスキップバイト数を返す。一致しない型の
/// ディスクリプタは自身の宣言長ぶんスキップされる。
///
/// 以下はすべて `DeviceError`:
/// - 残り長が要求ディスクリプタ長より短い
/// - 宣言長が2未満（無限ループ防止）
/// - 宣言長が残りバッファ長を超える
/// - 目的の型が見つかったが宣言長が要求長と一致しない（不正として扱い、
///   スキップしない）
///
/// 各ステップで最低2バイト消費するため、整形済み/途中切断を問わず
/// どんなバッファでも停止する。
pub fn next_descriptor(buffer: &[u8], wanted_type: u8, wanted_len: u8) -> UsbBusResult<usize> {
    let mut parsed = 0usize;
    let mut remaining = buffer.len();

    loop {
        // 残り長は要求ディスクリプタ長以上でなければならない
        if remaining < wanted_len as usize || remaining < 2 {
            return Err(UsbBusError::DeviceError);
        }

        let len = buffer[parsed] as usize;
        let desc_type = buffer[parsed + 1];

        if desc_type == wanted_type {
            if len == wanted_len as usize {
                return Ok(parsed);
            }
            // 目的の型で長さ不一致は不正ディスクリプタ
            return Err(UsbBusError::DeviceError);
        }

        // 宣言長は最低2、かつ残りバッファ長を超えてはならない
        if len < 2 {
            return Err(UsbBusError::DeviceError);
        }
        if len > remaining {
            return Err(UsbBusError::DeviceError);
        }

        // このディスクリプタをスキップ
        remaining -= len;
        parsed += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// (type, len) 並びからテスト用バッファを組み立てる
    fn build(descs: &[(u8, u8)]) -> Vec<u8> {
        let mut buf = Vec::new();
        for &(desc_type, len) in descs {
            buf.push(len);
            buf.push(desc_type);
            for _ in 2..len {
                buf.push(0xAA);
            }
        }
        buf
    }

    #[test]
    fn test_next_descriptor_first_match() {
        let buf = build(&[(2, 9)]);
        assert_eq!(next_descriptor(&buf, 2, 9), Ok(0));
    }

    #[test]
    fn test_next_descriptor_skips_unrelated() {
        // config(9) + unknown(5) + interface(9)
        let buf = build(&[(2, 9), (0x21, 5), (4, 9)]);
        assert_eq!(next_descriptor(&buf[9..], 4, 9), Ok(5));
        // バッファ先頭から探すと累積オフセット
        assert_eq!(next_descriptor(&buf, 4, 9), Ok(14));
    }

    #[test]
    fn test_next_descriptor_degenerate_length() {
        // 宣言長0はループせずエラー
        let mut buf = build(&[(2, 9), (4, 9)]);
        buf[0] = 0;
        assert_eq!(next_descriptor(&buf, 4, 9), Err(UsbBusError::DeviceError));

        // 宣言長1も同様
        buf[0] = 1;
        assert_eq!(next_descriptor(&buf, 4, 9), Err(UsbBusError::DeviceError));
    }

    #[test]
    fn test_next_descriptor_length_exceeds_remaining() {
        let mut buf = build(&[(2, 9), (4, 9)]);
        buf[0] = 200; // 残り18バイトに対して過大
        assert_eq!(next_descriptor(&buf, 4, 9), Err(UsbBusError::DeviceError));
    }

    #[test]
    fn test_next_descriptor_wanted_type_wrong_length() {
        // インターフェース型だが長さが7 → スキップせず不正扱い
        let buf = build(&[(4, 7), (4, 9)]);
        assert_eq!(next_descriptor(&buf, 4, 9), Err(UsbBusError::DeviceError));
    }

    #[test]
    fn test_next_descriptor_truncated_buffer() {
        // 要求長より短い残りはエラー
        let buf = build(&[(0x21, 5)]);
        assert_eq!(next_descriptor(&buf, 4, 9), Err(UsbBusError::DeviceError));

        let empty: [u8; 0] = [];
        assert_eq!(next_descriptor(&empty, 4, 9), Err(UsbBusError::DeviceError));
    }

    #[test]
    fn test_next_descriptor_terminates_on_garbage() {
        // 全バイト 0x02 のバッファ: 2バイトずつ消費して必ず終わる
        let buf = vec![0x02u8; 64];
        let result = next_descriptor(&buf, 4, 9);
        assert!(result.is_err());
    }

    #[test]
    fn test_device_descriptor_from_bytes() {
        let mut raw = [0u8; 18];
        raw[0] = 18;
        raw[1] = descriptor_type::DEVICE;
        raw[2] = 0x00;
        raw[3] = 0x02; // bcdUSB 2.00
        raw[7] = 64; // bMaxPacketSize0
        raw[8] = 0x8E;
        raw[9] = 0x05; // idVendor 0x058E
        raw[17] = 1;

        let desc = DeviceDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.b_length, 18);
        assert_eq!({ desc.bcd_usb }, 0x0200);
        assert_eq!(desc.b_max_packet_size0, 64);
        assert_eq!({ desc.id_vendor }, 0x058E);
        assert_eq!(desc.b_num_configurations, 1);

        // 長さ不足は None
        assert!(DeviceDescriptor::from_bytes(&raw[..17]).is_none());
    }

    #[test]
    fn test_configuration_descriptor_from_bytes() {
        let raw = [9u8, 2, 0x20, 0x00, 2, 1, 0, 0x80, 50];
        let desc = ConfigurationDescriptor::from_bytes(&raw).unwrap();
        assert_eq!({ desc.w_total_length }, 0x0020);
        assert_eq!(desc.b_num_interfaces, 2);
        assert_eq!(desc.b_configuration_value, 1);
    }

    #[test]
    fn test_parse_string_descriptor() {
        // "AB" のUTF-16LE文字列ディスクリプタ
        let raw = [6u8, 3, b'A', 0, b'B', 0];
        assert_eq!(parse_string_descriptor(&raw).unwrap(), "AB");

        // 型不一致
        let bad = [6u8, 4, b'A', 0, b'B', 0];
        assert!(parse_string_descriptor(&bad).is_none());

        // 宣言長がバッファ超過
        let short = [8u8, 3, b'A', 0];
        assert!(parse_string_descriptor(&short).is_none());
    }

    #[test]
    fn test_endpoint_descriptor_from_bytes() {
        // IN方向バルクエンドポイント 0x81
        let raw = [7u8, 5, 0x81, 0x02, 0x00, 0x02, 0];
        let desc = EndpointDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.endpoint_number(), 1);
        assert!(desc.is_in());
        assert_eq!({ desc.w_max_packet_size }, 512);

        // OUT方向 0x02
        let raw = [7u8, 5, 0x02, 0x02, 0x40, 0x00, 0];
        let desc = EndpointDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.endpoint_number(), 2);
        assert!(!desc.is_in());

        assert!(EndpointDescriptor::from_bytes(&raw[..6]).is_none());
    }

    #[test]
    fn test_hub_descriptor_from_bytes() {
        let raw = [9u8, 0x29, 4, 0x00, 0x00, 50, 0, 0];
        let desc = HubDescriptor::from_bytes(&raw).unwrap();
        assert_eq!(desc.b_nbr_ports, 4);
        assert_eq!(desc.b_pwr_on_2_pwr_good, 50);
    }
}
