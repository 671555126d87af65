#![no_std]
//! 软件 UART 驱动
//!
//! 面向只有一个 8 位定时器的小型单片机，用两个 GPIO 引脚以中断方式
//! 模拟 8-N-1 异步串口（全双工）。提供两层接口：
//! - 平台无关的位引擎 [`engine::SoftUart`]，通过 [`SerialLine`] 抽象访问硬件
//! - ATmega328P 绑定（`atmega328` 模块，仅 AVR 目标编译）

use bitflags::bitflags;

pub mod buffer;
pub mod engine;
pub mod timing;

#[cfg(target_arch = "avr")]
pub mod atmega328;

pub use engine::SoftUart;
pub use timing::Timing;

// ============================================================================
// 编译期常量
// ============================================================================

/// 接收缓冲区默认容量（字节）
pub const RX_BUFFER_SIZE: usize = 64;
/// 发送缓冲区默认容量（字节）
pub const TX_BUFFER_SIZE: usize = 64;
/// 默认 CPU 时钟频率（Hz）
pub const DEFAULT_CLOCK_HZ: u32 = 8_000_000;

// ============================================================================
// 错误类型定义
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// 尚未调用 initialise
    NotInitialised,
    /// 定时器已被占用（连接已建立或重复初始化）
    AlreadyRunning,
    /// 该端口上没有引脚电平变化中断
    UnsupportedPort,
    /// 引脚编号超出范围
    InvalidPin,
    /// 该时钟频率下无法得到合法的比较值
    BaudOutOfRange,
    /// 缓冲区已满
    BufferFull,
    /// 缓冲区被占用（协商锁被持有）
    Locked,
}

// ============================================================================
// 配置类型
// ============================================================================

/// 波特率档位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Baud {
    B2400 = 0,
    B9600 = 1,
    B19200 = 2,
    B38400 = 3,
    B57600 = 4,
    B115200 = 5,
}

impl Baud {
    /// 线上比特率（bit/s）
    pub const fn bits_per_second(self) -> u32 {
        match self {
            Baud::B2400 => 2_400,
            Baud::B9600 => 9_600,
            Baud::B19200 => 19_200,
            Baud::B38400 => 38_400,
            Baud::B57600 => 57_600,
            Baud::B115200 => 115_200,
        }
    }
}

/// GPIO 端口编号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    B,
    C,
    D,
}

/// 连接配置
///
/// 链式构造，未设置的项取默认值（9600 波特，TX=PB1，RX=PB2，8MHz 时钟）：
///
/// ```
/// use soft_serial::{Baud, Config, Port};
///
/// let config = Config::new()
///     .baud(Baud::B9600)
///     .tx_pin(Port::B, 1)
///     .rx_pin(Port::B, 2);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Config {
    baud: Baud,
    tx_port: Port,
    tx_pin: u8,
    rx_port: Port,
    rx_pin: u8,
    clock_hz: u32,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            baud: Baud::B9600,
            tx_port: Port::B,
            tx_pin: 1,
            rx_port: Port::B,
            rx_pin: 2,
            clock_hz: DEFAULT_CLOCK_HZ,
        }
    }

    /// 设置波特率
    pub const fn baud(mut self, baud: Baud) -> Self {
        self.baud = baud;
        self
    }

    /// 设置发送引脚
    pub const fn tx_pin(mut self, port: Port, pin: u8) -> Self {
        self.tx_port = port;
        self.tx_pin = pin;
        self
    }

    /// 设置接收引脚
    pub const fn rx_pin(mut self, port: Port, pin: u8) -> Self {
        self.rx_port = port;
        self.rx_pin = pin;
        self
    }

    /// 设置 CPU 时钟频率（与实际硬件不符会导致串口时序错误）
    pub const fn clock_hz(mut self, hz: u32) -> Self {
        self.clock_hz = hz;
        self
    }

    pub const fn get_baud(&self) -> Baud {
        self.baud
    }

    pub const fn get_tx(&self) -> (Port, u8) {
        (self.tx_port, self.tx_pin)
    }

    pub const fn get_rx(&self) -> (Port, u8) {
        (self.rx_port, self.rx_pin)
    }

    pub const fn get_clock_hz(&self) -> u32 {
        self.clock_hz
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 连接状态标志
// ============================================================================

bitflags! {
    /// 连接状态位集
    ///
    /// RX 子状态（`RECEIVED_START`/`RECEIVING`）与 TX 子状态
    /// （`SENT_START`/`SENDING`/`TX_LOCKED`）各自互斥，但可以同时存在，
    /// 这样两个方向才能全双工并行。没有任何子状态位即为空闲。
    /// `OVERFLOW` 是粘滞位，只能由 `clear_overflow` 或重新初始化清除。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkState: u8 {
        /// 连接已建立（定时器在跑）
        const RUNNING        = 0x01;
        /// 已捕获起始位下降沿，等待第一个数据位的采样时刻
        const RECEIVED_START = 0x02;
        /// 正在逐位接收数据
        const RECEIVING      = 0x04;
        /// 接收缓冲区曾经溢出（粘滞）
        const OVERFLOW       = 0x08;
        /// 已发出起始位
        const SENT_START     = 0x10;
        /// 正在逐位发送数据
        const SENDING        = 0x20;
        /// 发送缓冲区锁被前台持有，待重试出队
        const TX_LOCKED      = 0x40;
    }
}

impl LinkState {
    /// RX 方向是否空闲（不在帧中）
    pub fn rx_idle(&self) -> bool {
        !self.intersects(LinkState::RECEIVED_START | LinkState::RECEIVING)
    }

    /// TX 方向是否空闲（不在帧中且无待重试的出队）
    pub fn tx_idle(&self) -> bool {
        !self.intersects(LinkState::SENT_START | LinkState::SENDING | LinkState::TX_LOCKED)
    }
}

// ============================================================================
// 硬件抽象接口
// ============================================================================

/// 位引擎对硬件的全部要求
///
/// 由各芯片绑定实现（见 `atmega328` 模块），宿主机测试则用仿真线路实现。
/// 所有方法都会在中断上下文中被调用，必须保持 O(1) 且不阻塞。
pub trait SerialLine {
    /// TX 引脚拉高（空闲电平 / 停止位 / 数据 1）
    fn set_tx_high(&mut self);

    /// TX 引脚拉低（起始位 / 数据 0）
    fn set_tx_low(&mut self);

    /// RX 引脚当前是否为低电平
    #[cfg(not(feature = "tx-only"))]
    fn rx_is_low(&self) -> bool;

    /// 打开 RX 引脚的电平变化中断
    #[cfg(not(feature = "tx-only"))]
    fn enable_edge_capture(&mut self);

    /// 关闭 RX 引脚的电平变化中断
    #[cfg(not(feature = "tx-only"))]
    fn disable_edge_capture(&mut self);

    /// 当前定时器计数值，用于确定下降沿落在半位周期内的相位
    #[cfg(not(feature = "tx-only"))]
    fn timer_count(&self) -> u8;
}
