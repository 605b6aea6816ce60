//! 单在途写队列
//!
//! BLE 链路同一时间只允许一个写操作在途，平台协议栈又不提供排队，
//! 因此所有写请求都经过这里：
//!
//! - 只有队头会被提交给传输层
//! - 入队前队列为空时立即提交新的队头，否则等待前一个完成
//! - 完成回调（无论成功失败）都会弹出队头并提交下一个
//! - 同步拒绝的请求稍后重试一次，再失败就丢弃，不阻塞后续写入
//!
//! 描述符写和特征写是同一个 [`WriteQueue`] 的两个实例。

use std::collections::VecDeque;
use std::fmt;

use log::{debug, warn};

use crate::ble::transport::{LinkId, Transport, TransportError, WriteMode, WriteTicket};
use crate::ble::{CharHandle, DescriptorHandle};

/// 写队列的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Descriptor,
    Characteristic,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Descriptor => write!(f, "descriptor"),
            QueueKind::Characteristic => write!(f, "characteristic"),
        }
    }
}

/// 能被写队列提交的请求
pub trait WriteRequest: fmt::Debug {
    const KIND: QueueKind;

    fn submit(
        &self,
        transport: &mut dyn Transport,
        link: LinkId,
        ticket: WriteTicket,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub handle: DescriptorHandle,
    pub value: Vec<u8>,
}

impl WriteRequest for DescriptorWrite {
    const KIND: QueueKind = QueueKind::Descriptor;

    fn submit(
        &self,
        transport: &mut dyn Transport,
        link: LinkId,
        ticket: WriteTicket,
    ) -> Result<(), TransportError> {
        transport.write_descriptor(link, ticket, &self.handle, &self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicWrite {
    pub handle: CharHandle,
    pub value: Vec<u8>,
    pub mode: WriteMode,
}

impl WriteRequest for CharacteristicWrite {
    const KIND: QueueKind = QueueKind::Characteristic;

    fn submit(
        &self,
        transport: &mut dyn Transport,
        link: LinkId,
        ticket: WriteTicket,
    ) -> Result<(), TransportError> {
        transport.write_characteristic(link, ticket, &self.handle, &self.value, self.mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// 尚未提交
    Waiting,
    /// 已被传输层接受，等待完成回调
    InFlight,
    /// 被同步拒绝，等待重试定时器
    AwaitingRetry,
}

#[derive(Debug)]
struct Slot<T> {
    ticket: WriteTicket,
    request: T,
    state: SlotState,
    retried: bool,
}

/// 推进队列后调用方需要处理的后续动作
#[derive(Debug)]
pub struct Step<T> {
    /// 队头被拒绝，需要在延迟后调用 `retry`
    pub retry: Option<WriteTicket>,
    /// 重试后仍被拒绝而丢弃的请求
    pub dropped: Vec<(WriteTicket, T, TransportError)>,
}

impl<T> Default for Step<T> {
    fn default() -> Self {
        Self {
            retry: None,
            dropped: Vec::new(),
        }
    }
}

impl<T> Step<T> {
    pub fn is_empty(&self) -> bool {
        self.retry.is_none() && self.dropped.is_empty()
    }
}

/// 完成回调的处理结果
#[derive(Debug)]
pub enum Completion<T> {
    /// 票据与当前队头不符（重置前的遗留回调），已忽略
    Stale,
    /// 队头完成并出队
    Done { request: T, step: Step<T> },
}

/// 单在途 FIFO 写队列
#[derive(Debug)]
pub struct WriteQueue<T> {
    items: VecDeque<Slot<T>>,
    next_ticket: u64,
}

impl<T> Default for WriteQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            next_ticket: 0,
        }
    }
}

impl<T: WriteRequest> WriteQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 当前在途写的票据
    pub fn in_flight(&self) -> Option<WriteTicket> {
        self.items
            .front()
            .filter(|s| s.state == SlotState::InFlight)
            .map(|s| s.ticket)
    }

    /// 最近入队的请求的票据
    pub fn last_ticket(&self) -> Option<WriteTicket> {
        self.items.back().map(|s| s.ticket)
    }

    /// 入队；入队前队列为空时立即提交
    pub fn enqueue(
        &mut self,
        request: T,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Step<T> {
        let was_empty = self.items.is_empty();
        self.next_ticket += 1;
        let ticket = WriteTicket(self.next_ticket);
        debug!("Queue {} write {}: {:?}", T::KIND, ticket, request);
        self.items.push_back(Slot {
            ticket,
            request,
            state: SlotState::Waiting,
            retried: false,
        });

        if was_empty {
            self.pump(transport, link)
        } else {
            Step::default()
        }
    }

    /// 处理完成回调：无论成功失败都弹出队头，然后提交下一个
    pub fn complete(
        &mut self,
        ticket: WriteTicket,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Completion<T> {
        let matches = self
            .items
            .front()
            .is_some_and(|s| s.ticket == ticket && s.state == SlotState::InFlight);
        if !matches {
            debug!("Ignoring stale {} write completion {}", T::KIND, ticket);
            return Completion::Stale;
        }

        let Some(slot) = self.items.pop_front() else {
            return Completion::Stale;
        };
        let step = self.pump(transport, link);
        Completion::Done {
            request: slot.request,
            step,
        }
    }

    /// 重试定时器到期
    pub fn retry(
        &mut self,
        ticket: WriteTicket,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Step<T> {
        match self.items.front_mut() {
            Some(head) if head.ticket == ticket && head.state == SlotState::AwaitingRetry => {
                debug!("Retrying {} write {}", T::KIND, ticket);
                head.state = SlotState::Waiting;
                head.retried = true;
                self.pump(transport, link)
            }
            _ => {
                debug!("Ignoring stale {} write retry {}", T::KIND, ticket);
                Step::default()
            }
        }
    }

    /// 丢弃全部请求，不提交；返回丢弃的数量
    ///
    /// 票据计数不清零，重置前的回调因此永远不会匹配新的队头。
    pub fn reset(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    fn pump(&mut self, transport: &mut dyn Transport, link: LinkId) -> Step<T> {
        let mut step = Step::default();

        while let Some(head) = self.items.front_mut() {
            if head.state != SlotState::Waiting {
                break;
            }

            match head.request.submit(transport, link, head.ticket) {
                Ok(()) => {
                    head.state = SlotState::InFlight;
                    break;
                }
                Err(e) if !head.retried => {
                    debug!("{} write {} rejected ({}), will retry", T::KIND, head.ticket, e);
                    head.state = SlotState::AwaitingRetry;
                    step.retry = Some(head.ticket);
                    break;
                }
                Err(e) => {
                    warn!("Failed to write {}: {}", T::KIND, e);
                    if let Some(slot) = self.items.pop_front() {
                        step.dropped.push((slot.ticket, slot.request, e));
                    }
                }
            }
        }

        step
    }
}

/// 描述符写与特征写两个独立队列
///
/// 这是唯一会调用传输层写操作的地方。
#[derive(Debug, Default)]
pub struct WriteSerializer {
    descriptors: WriteQueue<DescriptorWrite>,
    characteristics: WriteQueue<CharacteristicWrite>,
}

impl WriteSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptors(&self) -> &WriteQueue<DescriptorWrite> {
        &self.descriptors
    }

    pub fn characteristics(&self) -> &WriteQueue<CharacteristicWrite> {
        &self.characteristics
    }

    pub fn enqueue_descriptor_write(
        &mut self,
        transport: &mut dyn Transport,
        link: LinkId,
        handle: DescriptorHandle,
        value: Vec<u8>,
    ) -> Step<DescriptorWrite> {
        self.descriptors
            .enqueue(DescriptorWrite { handle, value }, transport, link)
    }

    pub fn enqueue_characteristic_write(
        &mut self,
        transport: &mut dyn Transport,
        link: LinkId,
        handle: CharHandle,
        value: Vec<u8>,
        mode: WriteMode,
    ) -> Step<CharacteristicWrite> {
        self.characteristics.enqueue(
            CharacteristicWrite {
                handle,
                value,
                mode,
            },
            transport,
            link,
        )
    }

    pub fn on_descriptor_written(
        &mut self,
        ticket: WriteTicket,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Completion<DescriptorWrite> {
        self.descriptors.complete(ticket, transport, link)
    }

    pub fn on_characteristic_written(
        &mut self,
        ticket: WriteTicket,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Completion<CharacteristicWrite> {
        self.characteristics.complete(ticket, transport, link)
    }

    pub fn retry_descriptor(
        &mut self,
        ticket: WriteTicket,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Step<DescriptorWrite> {
        self.descriptors.retry(ticket, transport, link)
    }

    pub fn retry_characteristic(
        &mut self,
        ticket: WriteTicket,
        transport: &mut dyn Transport,
        link: LinkId,
    ) -> Step<CharacteristicWrite> {
        self.characteristics.retry(ticket, transport, link)
    }

    pub fn reset(&mut self) {
        let d = self.descriptors.reset();
        let c = self.characteristics.reset();
        if d + c > 0 {
            debug!("Dropped {d} descriptor and {c} characteristic write(s) on reset");
        }
    }
}
