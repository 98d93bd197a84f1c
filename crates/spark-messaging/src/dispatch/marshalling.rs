use std::collections::HashMap;

use parking_lot::Mutex;

use super::Dispatch;
use crate::{
    error::MessagingError,
    message::{ChannelKey, ChannelMessage, ChannelMetaInfo, ChannelTarget, Message},
};

/// 发送侧的通道键驻留：把 `ChannelMessage(Key)` 改写为紧凑的 `ChannelMessage(Id)`。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 某个键第一次出现时，先向下游发送 `ChannelMetaInfo { key, id }`，再发送
///   以 id 寻址的消息；id 从 0 起按首次使用顺序分配，在本实例生命周期内不变；
/// - 已驻留的键直接改写；其它消息原样透传。
///
/// ## 实现 (How)
/// - 分配 id 与两次下游分发在同一把锁内完成，保证并发调用方观察到的
///   元信息总是先于对应的 id 消息；
/// - 元信息分发失败时不记录该键，下一次使用会重新声明。
pub struct ChannelMessageMarshallingDispatch<D> {
    downstream: D,
    ids: Mutex<Interning>,
}

#[derive(Default)]
struct Interning {
    ids: HashMap<ChannelKey, u32>,
    next: u32,
}

impl<D> ChannelMessageMarshallingDispatch<D>
where
    D: Dispatch<Message>,
{
    pub fn new(downstream: D) -> Self {
        Self {
            downstream,
            ids: Mutex::new(Interning::default()),
        }
    }

    /// 已驻留的键数量。
    pub fn interned(&self) -> usize {
        self.ids.lock().ids.len()
    }
}

impl<D> Dispatch<Message> for ChannelMessageMarshallingDispatch<D>
where
    D: Dispatch<Message>,
{
    fn dispatch(&self, message: Message) -> Result<(), MessagingError> {
        let (key, payload) = match message {
            Message::ChannelMessage(ChannelMessage {
                channel: ChannelTarget::Key(key),
                payload,
            }) => (key, payload),
            other => return self.downstream.dispatch(other),
        };

        let mut interning = self.ids.lock();
        let id = match interning.ids.get(&key) {
            Some(id) => *id,
            None => {
                let id = interning.next;
                self.downstream.dispatch(Message::ChannelMetaInfo(ChannelMetaInfo {
                    key: key.clone(),
                    id,
                }))?;
                tracing::debug!(channel_key = %key, id, "interned channel key");
                interning.next = interning.next.wrapping_add(1);
                interning.ids.insert(key, id);
                id
            }
        };
        self.downstream.dispatch(Message::ChannelMessage(ChannelMessage {
            channel: ChannelTarget::Id(id),
            payload,
        }))
    }
}

/// 接收侧的反向映射：消费 `ChannelMetaInfo`，把 `ChannelMessage(Id)` 还原为键寻址。
pub struct ChannelMessageUnmarshallingDispatch<D> {
    downstream: D,
    keys: Mutex<HashMap<u32, ChannelKey>>,
}

impl<D> ChannelMessageUnmarshallingDispatch<D>
where
    D: Dispatch<Message>,
{
    pub fn new(downstream: D) -> Self {
        Self {
            downstream,
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl<D> Dispatch<Message> for ChannelMessageUnmarshallingDispatch<D>
where
    D: Dispatch<Message>,
{
    fn dispatch(&self, message: Message) -> Result<(), MessagingError> {
        match message {
            Message::ChannelMetaInfo(ChannelMetaInfo { key, id }) => {
                self.keys.lock().insert(id, key);
                Ok(())
            }
            Message::ChannelMessage(ChannelMessage {
                channel: ChannelTarget::Id(id),
                payload,
            }) => {
                let key = self
                    .keys
                    .lock()
                    .get(&id)
                    .cloned()
                    .ok_or(MessagingError::UnknownChannelId { id })?;
                self.downstream
                    .dispatch(Message::ChannelMessage(ChannelMessage {
                        channel: ChannelTarget::Key(key),
                        payload,
                    }))
            }
            other => self.downstream.dispatch(other),
        }
    }
}
