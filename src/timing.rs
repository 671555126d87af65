//! 定时器参数推导
//!
//! 定时器工作在比较匹配清零（CTC）模式，中断频率约为波特率的 2 倍，
//! 每次中断对应半个位时间。本模块根据 CPU 时钟和波特率档位推导：
//! - 预分频器与比较值 OCR
//! - 下降沿相位判定阈值（约为 OCR/2，加少量中断入口延迟余量）
//! - 低波特率下的"多圈计数"系数 stretch
//!
//! 预分频器的选择依据 8 位定时器的计数范围：时钟不超过 4MHz 时直接用
//! CLK I/O，再高就必须 /8，否则最低档波特率计不满一个半位周期。/8 之后
//! 更高的时钟（约 19.66MHz 起）会让最低档波特率超出 256 个计数，这时
//! 不再换更粗的分频（会丢掉最高档），而是让 ISR 连续数 stretch 圈再
//! 处理一个半位。

use crate::{Baud, SerialError};

// ============================================================================
// 8MHz 参考表
// ============================================================================

// 比较值按 OCR = round(F_CPU / 预分频 / (2 × 波特率)) − 1 取整，
// 下面是出厂时钟 8MHz、预分频 /8（定时器 1MHz）下的各档位取值。

/// 2400 波特：1MHz / 4800 ≈ 208.3
pub const OCR_8MHZ_2400: u8 = 207;
/// 9600 波特：1MHz / 19200 ≈ 52.1
pub const OCR_8MHZ_9600: u8 = 51;
/// 19200 波特：1MHz / 38400 ≈ 26.0
pub const OCR_8MHZ_19200: u8 = 25;
/// 38400 波特：1MHz / 76800 ≈ 13.0
pub const OCR_8MHZ_38400: u8 = 12;
/// 57600 波特：1MHz / 115200 ≈ 8.7
pub const OCR_8MHZ_57600: u8 = 8;
/// 115200 波特：1MHz / 230400 ≈ 4.3
pub const OCR_8MHZ_115200: u8 = 3;

/// 8MHz 时钟下按波特率档位索引的 OCR 表
pub const OCR_TABLE_8MHZ: [u8; 6] = [
    OCR_8MHZ_2400,
    OCR_8MHZ_9600,
    OCR_8MHZ_19200,
    OCR_8MHZ_38400,
    OCR_8MHZ_57600,
    OCR_8MHZ_115200,
];

/// 预分频器换挡点：超过此时钟频率必须 /8
pub const PRESCALE_SWITCH_HZ: u32 = 4_000_000;

/// 相位阈值在半位中点之上的余量（定时器计数），补偿边沿中断入口延迟
pub const EDGE_LATENCY_MARGIN: u8 = 2;

/// stretch 上限，对应约 39MHz 以内的时钟
pub const MAX_STRETCH: u8 = 4;

// ============================================================================
// 推导
// ============================================================================

/// 定时器预分频器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prescaler {
    Div1,
    Div8,
}

impl Prescaler {
    pub const fn divisor(self) -> u32 {
        match self {
            Prescaler::Div1 => 1,
            Prescaler::Div8 => 8,
        }
    }
}

/// 一组可直接写入定时器的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub prescaler: Prescaler,
    /// 比较匹配值，半位周期 = (ocr + 1) × stretch 个定时器计数
    pub ocr: u8,
    /// 下降沿相位低于此值视为"落在半位周期前半段"。单位是定时器
    /// 计数，跨越整组 stretch 子周期，所以 stretch 大于 1 时可能
    /// 超出单圈的 8 位范围
    pub threshold: u16,
    /// 每个半位对应的中断次数，1 即每次中断处理一个半位
    pub stretch: u8,
}

impl Timing {
    /// 由时钟频率和波特率档位推导定时器参数
    ///
    /// 定时器太快（OCR 会小于 1）时返回 [`SerialError::BaudOutOfRange`]。
    pub fn derive(clock_hz: u32, baud: Baud) -> Result<Timing, SerialError> {
        let prescaler = if clock_hz <= PRESCALE_SWITCH_HZ {
            Prescaler::Div1
        } else {
            Prescaler::Div8
        };
        let timer_hz = clock_hz / prescaler.divisor();
        let half_bit_hz = 2 * baud.bits_per_second();

        let mut stretch = 1u8;
        loop {
            let den = half_bit_hz * stretch as u32;
            let divisor = (timer_hz + den / 2) / den;
            if divisor <= 256 {
                if divisor < 2 {
                    return Err(SerialError::BaudOutOfRange);
                }
                let ocr = (divisor - 1) as u8;
                return Ok(Timing {
                    prescaler,
                    ocr,
                    threshold: threshold_for(ocr, stretch),
                    stretch,
                });
            }
            if stretch >= MAX_STRETCH {
                return Err(SerialError::BaudOutOfRange);
            }
            stretch += 1;
        }
    }
}

/// 相位判定阈值：半位中点加上中断入口延迟余量
///
/// stretch 大于 1 时半位跨越多个子周期，中点要按整组计数算，单看
/// 一圈的计数值分不出边沿落在组内第几圈。
const fn threshold_for(ocr: u8, stretch: u8) -> u16 {
    let span = (ocr as u16 + 1) * stretch as u16;
    let t = span / 2 + EDGE_LATENCY_MARGIN as u16;
    if t >= span {
        span - 1
    } else {
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_matches_8mhz_table() {
        let bauds = [
            Baud::B2400,
            Baud::B9600,
            Baud::B19200,
            Baud::B38400,
            Baud::B57600,
            Baud::B115200,
        ];
        for baud in bauds {
            let t = Timing::derive(8_000_000, baud).unwrap();
            assert_eq!(t.prescaler, Prescaler::Div8);
            assert_eq!(t.ocr, OCR_TABLE_8MHZ[baud as usize], "{:?}", baud);
            assert_eq!(t.stretch, 1, "{:?}", baud);
        }
    }

    #[test]
    fn test_slow_clock_uses_no_prescaler() {
        let t = Timing::derive(4_000_000, Baud::B9600).unwrap();
        assert_eq!(t.prescaler, Prescaler::Div1);
        // 4MHz / 19200 ≈ 208.3
        assert_eq!(t.ocr, 207);
        assert_eq!(t.stretch, 1);
    }

    #[test]
    fn test_fast_clock_stretches_low_baud() {
        // 16MHz /8 → 2MHz，2400 波特需要计数 417，两圈正好
        let t = Timing::derive(16_000_000, Baud::B2400).unwrap();
        assert_eq!(t.stretch, 2);
        assert_eq!(t.ocr, 207);

        // 20MHz /8 → 2.5MHz，需要三圈
        let t = Timing::derive(20_000_000, Baud::B2400).unwrap();
        assert_eq!(t.stretch, 3);
        assert_eq!(t.ocr, 173);

        // 高波特率不受影响
        let t = Timing::derive(20_000_000, Baud::B115200).unwrap();
        assert_eq!(t.stretch, 1);
        assert_eq!(t.ocr, 10);
    }

    #[test]
    fn test_too_slow_clock_rejected() {
        assert_eq!(
            Timing::derive(250_000, Baud::B115200),
            Err(SerialError::BaudOutOfRange)
        );
    }

    #[test]
    fn test_threshold_near_half_bit() {
        let t = Timing::derive(8_000_000, Baud::B9600).unwrap();
        assert_eq!(
            t.threshold,
            (t.ocr as u16 + 1) / 2 + EDGE_LATENCY_MARGIN as u16
        );

        // stretch 分组时中点按整组子周期计，超出单圈范围
        let t = Timing::derive(20_000_000, Baud::B2400).unwrap();
        let span = (t.ocr as u16 + 1) * t.stretch as u16;
        assert_eq!(t.threshold, span / 2 + EDGE_LATENCY_MARGIN as u16);
        assert!(t.threshold > 255);

        // OCR 很小时阈值被压在半位之内
        let t = Timing::derive(8_000_000, Baud::B115200).unwrap();
        assert!(t.threshold < (t.ocr as u16 + 1) * t.stretch as u16);
    }
}
