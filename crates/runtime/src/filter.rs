//! 容器日志字节过滤
//!
//! 容器日志流中夹杂帧标记字节 {0x00, 0x01, 0x0B}，写入日志分片
//! 或结果快照前全部丢弃。

/// 过滤控制字节，返回干净的文本
pub fn filter_control_bytes(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(*c, '\u{00}' | '\u{01}' | '\u{0B}'))
        .collect()
}
