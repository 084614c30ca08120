//! GATT 注册表
//!
//! central 与 peripheral 两端共用的服务/特征定义。UUID 是双方事先约定的常量，
//! 运行时不做协商。

use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1111_1111_111111111111);
pub const READ_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_1111_1111_1111_111111111111);
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_2222_1111_1111_111111111111);
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_3333_1111_1111_111111111111);
pub const INDICATE_CHAR_UUID: Uuid = Uuid::from_u128(0x00000000_4444_1111_1111_111111111111);

/// 特征在本服务中承担的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CharacteristicRole {
    Read,
    Write,
    Notify,
    Indicate,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 4] = [
        CharacteristicRole::Read,
        CharacteristicRole::Write,
        CharacteristicRole::Notify,
        CharacteristicRole::Indicate,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            CharacteristicRole::Read => READ_CHAR_UUID,
            CharacteristicRole::Write => WRITE_CHAR_UUID,
            CharacteristicRole::Notify => NOTIFY_CHAR_UUID,
            CharacteristicRole::Indicate => INDICATE_CHAR_UUID,
        }
    }

    /// 按 UUID 反查角色，未知 UUID 返回 `None`
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CharacteristicRole::Read => "read",
            CharacteristicRole::Write => "write",
            CharacteristicRole::Notify => "notify",
            CharacteristicRole::Indicate => "indicate",
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 特征支持的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GattOperation {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

/// 访问权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub readable: bool,
    pub writeable: bool,
}

impl Permissions {
    pub const READABLE: Permissions = Permissions {
        readable: true,
        writeable: false,
    };
    pub const READ_WRITE: Permissions = Permissions {
        readable: true,
        writeable: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub operations: BTreeSet<GattOperation>,
    pub permissions: Permissions,
}

impl CharacteristicDescriptor {
    pub fn new(
        uuid: Uuid,
        operations: impl IntoIterator<Item = GattOperation>,
        permissions: Permissions,
    ) -> Self {
        Self {
            uuid,
            operations: operations.into_iter().collect(),
            permissions,
        }
    }

    pub fn supports(&self, op: GattOperation) -> bool {
        self.operations.contains(&op)
    }

    pub fn allows_read(&self) -> bool {
        self.supports(GattOperation::Read) && self.permissions.readable
    }

    pub fn allows_write(&self) -> bool {
        (self.supports(GattOperation::Write) || self.supports(GattOperation::WriteWithoutResponse))
            && self.permissions.writeable
    }

    /// 是否可以被订阅 (notify 或 indicate)
    pub fn allows_subscribe(&self) -> bool {
        self.supports(GattOperation::Notify) || self.supports(GattOperation::Indicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }

    pub fn characteristic_uuids(&self) -> Vec<Uuid> {
        self.characteristics.iter().map(|c| c.uuid).collect()
    }
}

/// 默认服务：一个 primary service 加 read / write / notify / indicate 四个特征
pub fn default_service() -> ServiceDescriptor {
    ServiceDescriptor {
        uuid: SERVICE_UUID,
        primary: true,
        characteristics: vec![
            CharacteristicDescriptor::new(
                READ_CHAR_UUID,
                [GattOperation::Read],
                Permissions::READABLE,
            ),
            CharacteristicDescriptor::new(
                WRITE_CHAR_UUID,
                [GattOperation::Read, GattOperation::Write],
                Permissions::READ_WRITE,
            ),
            CharacteristicDescriptor::new(
                NOTIFY_CHAR_UUID,
                [GattOperation::Notify],
                Permissions::READABLE,
            ),
            CharacteristicDescriptor::new(
                INDICATE_CHAR_UUID,
                [GattOperation::Indicate],
                Permissions::READABLE,
            ),
        ],
    }
}

/// ATT 层结果码 (Core Spec Vol 3, Part F, 3.4.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttResult {
    Success = 0x00,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    AttributeNotFound = 0x0A,
}

impl AttResult {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AttResult::Success)
    }
}

impl fmt::Display for AttResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.code())
    }
}

/// 对一次 ATT 请求的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttResponse {
    pub result: AttResult,
    pub value: Option<Vec<u8>>,
}

impl AttResponse {
    pub fn success(value: Option<Vec<u8>>) -> Self {
        Self {
            result: AttResult::Success,
            value,
        }
    }

    pub fn error(result: AttResult) -> Self {
        Self {
            result,
            value: None,
        }
    }
}
