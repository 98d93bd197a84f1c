#![no_main]

use bytes::{Bytes, BytesMut};
use libfuzzer_sys::fuzz_target;
use spark_messaging::codec;

/// 任意字节都不能让解码器 panic；成功解码的消息重新编码后必须得到同一条消息。
///
/// - **Why**：解码器直接面对网络输入，长度字段、嵌套深度与 UTF-8 都可能被构造；
/// - **What**：失败只能以 `MessagingError` 返回，成功路径满足“解码 → 编码 → 解码”稳定。
fuzz_target!(|data: &[u8]| {
    let Ok(message) = codec::decode(Bytes::copy_from_slice(data)) else {
        return;
    };
    let mut encoded = BytesMut::new();
    codec::encode(&message, &mut encoded).expect("解码得到的消息必然可编码");
    let again = codec::decode(encoded.freeze()).expect("重新编码的字节必然可解码");
    assert_eq!(again, message);
});
