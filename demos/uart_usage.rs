//! 软件串口基本用法：初始化、发送、回显
//!
//! 接线：PB1 为 TX，PB2 为 RX，对端是任意 9600 8-N-1 串口。

#![cfg_attr(target_arch = "avr", no_std)]
#![cfg_attr(target_arch = "avr", no_main)]

#[cfg(target_arch = "avr")]
mod demo {
    use panic_halt as _;

    use soft_serial::atmega328 as serial;
    use soft_serial::{Baud, Config, Port};

    #[avr_device::entry]
    fn main() -> ! {
        let config = Config::new()
            .baud(Baud::B9600)
            .tx_pin(Port::B, 1)
            .rx_pin(Port::B, 2);

        if serial::initialise(config).is_err() {
            loop {}
        }

        // 单字节与字符串发送
        serial::put_char(b'A').ok();
        serial::send_data(b"Bits of sand");

        // 收到什么回什么
        loop {
            if serial::data_pending() > 0 {
                let byte = serial::get_char();
                while serial::put_char(byte).is_err() {}
            }
        }
    }
}

#[cfg(not(target_arch = "avr"))]
fn main() {
    // 本示例只面向 AVR 目标
}
