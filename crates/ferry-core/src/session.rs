//! Transfer sessions.
//!
//! One session drives one local channel from startup to close. The
//! requester side initiates the handshake sequence and either streams the
//! file out or retrieves it; the requested side serves inbound channels,
//! validating every packet against the host and rule directories. Both
//! sides run the same dual state machine and check every packet's implied
//! transition before acting on it; a violation forces the session into the
//! error state and, when the channel is still writable, tells the peer why.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::blockfile::{resolve_in, BlockFile};
use crate::channel::{ActiveChannels, ChannelClaim, PacketStream, TransferOutcome};
use crate::directory::{
    run_step_tasks, HostAuthLookup, RuleConfig, RuleLookup, TaskContext, TaskHook,
};
use crate::error::{Error, Result};
use crate::packet::{
    AuthentPacket, DataPacket, EndRequestPacket, EndTransferPacket, ErrorAction, ErrorPacket,
    KeepAlivePacket, Packet, PacketType, RequestPacket, StartupPacket, ValidPacket, Way,
};
use crate::record::{GlobalStep, StepCode, TransferRecord, UpdatedInfo};
use crate::state::{SessionState, StateMachine};
use crate::store::TransferStore;

/// Everything a session needs from its daemon.
pub struct SessionContext {
    /// Identity announced in the Authent handshake
    pub host_id: String,
    /// Shared secret proven in the Authent handshake
    pub host_key: String,
    /// Software version string
    pub version: String,
    /// Host directory
    pub hosts: Arc<dyn HostAuthLookup>,
    /// Rule directory
    pub rules: Arc<dyn RuleLookup>,
    /// Record store
    pub store: Arc<dyn TransferStore>,
    /// Task hook
    pub tasks: Arc<dyn TaskHook>,
    /// Live channel registry
    pub active: Arc<ActiveChannels>,
    /// Raised by an authenticated Shutdown packet; the daemon polls it
    pub shutdown: AtomicBool,
    /// Raised by an authenticated BlockRequest; refuses new requests
    pub blocked: AtomicBool,
}

impl SessionContext {
    /// Whether a shutdown was requested through the protocol.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("host_id", &self.host_id)
            .finish_non_exhaustive()
    }
}

/// The state a received packet implies, given who is sending the file.
fn inbound_state(packet: &Packet, requester_sends: bool) -> Option<SessionState> {
    match packet {
        Packet::Startup(_) => Some(SessionState::Startup),
        Packet::Authent(p) => Some(match p.way {
            Way::Ask => SessionState::AuthentRequester,
            Way::Answer => SessionState::AuthentRequested,
        }),
        Packet::Request(p) => Some(match p.way {
            Way::Ask => SessionState::RequestRequester,
            Way::Answer => SessionState::Valid,
        }),
        Packet::Data(_) => Some(if requester_sends {
            SessionState::DataRequester
        } else {
            SessionState::DataRequested
        }),
        Packet::EndTransfer(p) => Some(match p.way {
            Way::Ask => SessionState::EndTransferRequester,
            Way::Answer => SessionState::EndTransferRequested,
        }),
        Packet::EndRequest(p) => Some(match p.way {
            Way::Ask => SessionState::EndRequestRequester,
            Way::Answer => SessionState::EndRequestRequested,
        }),
        Packet::Test(_) => Some(SessionState::Test),
        Packet::Information(_) => Some(SessionState::Information),
        Packet::Shutdown(_) => Some(SessionState::Shutdown),
        Packet::Valid(_)
        | Packet::BlockRequest(_)
        | Packet::BusinessRequest(_)
        | Packet::JsonCommand(_) => Some(SessionState::ValidOther),
        Packet::KeepAlive(_) | Packet::NoOp | Packet::Error(_) | Packet::ConnectionError(_) => {
            None
        }
    }
}

fn remote_error(message: &str, code_char: Option<char>) -> Error {
    let code = code_char
        .and_then(StepCode::from_char)
        .unwrap_or(StepCode::RemoteError);
    Error::Remote {
        code,
        message: message.to_string(),
    }
}

/// Check a received packet against the machine and return it, converting
/// Error/ConnectionError packets from the peer into remote errors.
fn admit(
    machine: &mut StateMachine,
    packet: Packet,
    requester_sends: bool,
) -> Result<Packet> {
    match &packet {
        Packet::Error(p) => {
            return Err(remote_error(&p.message, p.detail.chars().next()));
        }
        Packet::ConnectionError(p) => {
            return Err(remote_error(&p.message, None));
        }
        _ => {}
    }
    if let Some(state) = inbound_state(&packet, requester_sends) {
        machine.try_transition(state)?;
    }
    Ok(packet)
}

/// Send the protocol-level error to the peer when the channel is still
/// writable, per the propagation policy: only errors the peer cannot have
/// seen yet are reported back.
async fn report_failure(stream: &mut PacketStream, error: &Error) {
    let report = matches!(
        error,
        Error::Framing(_)
            | Error::IllegalTransition { .. }
            | Error::DataIntegrity { .. }
            | Error::BadAuthent(_)
            | Error::RuleNotFound(_)
            | Error::RunnerConfig(_)
            | Error::Task { .. }
    );
    if !report {
        return;
    }
    let packet = Packet::Error(ErrorPacket {
        message: error.to_string(),
        detail: error.step_code().as_char().to_string(),
        action: ErrorAction::ForwardAndClose,
    });
    stream.write_best_effort(&packet).await;
}

async fn persist(ctx: &SessionContext, record: &TransferRecord) {
    if let Err(e) = ctx.store.update(record).await {
        tracing::debug!(error = %e, "Could not persist record state");
    }
}

/// Run one phase's task list and move the record through the step.
async fn run_phase(
    ctx: &SessionContext,
    record: &mut TransferRecord,
    rule: &RuleConfig,
    step: GlobalStep,
    file_path: Option<PathBuf>,
) -> Result<()> {
    record.set_global_step(step);
    persist(ctx, record).await;
    let tasks = match step {
        GlobalStep::PreTask => &rule.pre_tasks,
        GlobalStep::PostTask => &rule.post_tasks,
        GlobalStep::ErrorTask => &rule.error_tasks,
        _ => return Ok(()),
    };
    let task_ctx = TaskContext {
        record: record.clone(),
        step,
        file_path,
    };
    run_step_tasks(&ctx.tasks, tasks, &task_ctx).await
}

/// Resolve the file a sending side reads from. Absolute names are the
/// sender's own files; relative names live under the rule's send path.
fn outbound_path(rule: &RuleConfig, filename: &str) -> Result<PathBuf> {
    let path = Path::new(filename);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        resolve_in(&rule.send_path, filename)
    }
}

fn file_basename(filename: &str) -> Result<String> {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| Error::InvalidPath(filename.to_string()))
}

/// Stream the file out, block by block, starting at the record's rank.
async fn send_blocks(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    record: &mut TransferRecord,
    ctx: &SessionContext,
    file: &mut BlockFile,
    data_state: SessionState,
) -> Result<()> {
    let with_key = record.mode.is_integrity_checked();
    file.seek_to_rank(record.rank).await?;
    machine.try_transition(data_state)?;

    if file.len() > 0 {
        loop {
            let rank = record.rank;
            let (data, last) = file.read_block().await?;
            if data.is_empty() {
                break;
            }
            machine.try_transition(data_state)?;
            let packet = if with_key {
                DataPacket::with_key(rank, data)
            } else {
                DataPacket::without_key(rank, data)
            };
            stream.write(&Packet::Data(packet)).await?;
            record.advance_rank(rank + 1);
            persist(ctx, record).await;
            if last {
                break;
            }
        }
    }
    Ok(())
}

/// Drive the two-phase end handshake from the sending side.
async fn finish_as_sender(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    record: &TransferRecord,
    file: &BlockFile,
    requester_sends: bool,
) -> Result<()> {
    let digest = if record.mode.is_integrity_checked() {
        Some(file.sha256_hex().await?)
    } else {
        None
    };
    machine.try_transition(SessionState::EndTransferRequester)?;
    stream
        .write(&Packet::EndTransfer(EndTransferPacket {
            request: PacketType::Request as u8,
            way: Way::Ask,
            digest,
        }))
        .await?;

    let packet = admit(machine, stream.read().await?, requester_sends)?;
    let Packet::EndTransfer(answer) = packet else {
        return Err(Error::Framing(format!(
            "expected end-of-transfer answer, got {packet}"
        )));
    };
    if answer.way != Way::Answer {
        return Err(Error::Framing("unanswered end-of-transfer ask".into()));
    }

    machine.try_transition(SessionState::EndRequestRequester)?;
    stream
        .write(&Packet::EndRequest(EndRequestPacket {
            code: u32::from(StepCode::CompleteOk.as_char()),
            way: Way::Ask,
            optional: None,
        }))
        .await?;

    let packet = admit(machine, stream.read().await?, requester_sends)?;
    let Packet::EndRequest(answer) = packet else {
        return Err(Error::Framing(format!(
            "expected end-of-request answer, got {packet}"
        )));
    };
    if answer.way != Way::Answer {
        return Err(Error::Framing("unanswered end-of-request ask".into()));
    }
    machine.try_transition(SessionState::ClosedChannel)?;
    Ok(())
}

/// Receive blocks until the end-of-transfer ask arrives, then answer the
/// two-phase end handshake. Returns the finalized file path.
#[allow(clippy::too_many_arguments)]
async fn receive_blocks(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    record: &mut TransferRecord,
    ctx: &SessionContext,
    rule: &RuleConfig,
    mut file: BlockFile,
    data_state: SessionState,
    requester_sends: bool,
) -> Result<PathBuf> {
    let check_keys = record.mode.is_integrity_checked();
    let mut expected = record.rank;

    loop {
        let raw = stream.read().await?;
        // a zero-block file still passes through the data phase
        if matches!(&raw, Packet::EndTransfer(e) if e.way == Way::Ask)
            && machine.current() != data_state
        {
            machine.try_transition(data_state)?;
        }
        let packet = admit(machine, raw, requester_sends)?;
        match packet {
            Packet::Data(data) => {
                debug_assert_eq!(machine.current(), data_state);
                if data.rank != expected {
                    return Err(Error::Framing(format!(
                        "out-of-order block {} while expecting {expected}",
                        data.rank
                    )));
                }
                if check_keys && !data.is_key_valid() {
                    return Err(Error::DataIntegrity { rank: data.rank });
                }
                file.write_block(&data.data).await?;
                expected += 1;
                record.advance_rank(expected);
                persist(ctx, record).await;
            }
            Packet::EndTransfer(end) if end.way == Way::Ask => {
                file.flush().await?;
                if let Some(expected_digest) = &end.digest {
                    let actual = file.sha256_hex().await?;
                    if &actual != expected_digest {
                        return Err(Error::DataIntegrity { rank: record.rank });
                    }
                }
                // post tasks run before the final rename when the tasks want
                // the work path; the rename is the commit point
                run_phase(
                    ctx,
                    record,
                    rule,
                    GlobalStep::PostTask,
                    Some(file.path().to_path_buf()),
                )
                .await?;
                let final_name = file_basename(&record.filename)?;
                let target = file.rename_to_final(&rule.recv_path, &final_name).await?;
                record.filename = target.display().to_string();

                stream
                    .write(&Packet::EndTransfer(EndTransferPacket {
                        request: PacketType::Request as u8,
                        way: Way::Answer,
                        digest: None,
                    }))
                    .await?;
                machine.try_transition(SessionState::EndTransferRequested)?;

                let packet = admit(machine, stream.read().await?, requester_sends)?;
                let Packet::EndRequest(ask) = packet else {
                    return Err(Error::Framing(format!(
                        "expected end-of-request ask, got {packet}"
                    )));
                };
                if ask.way != Way::Ask {
                    return Err(Error::Framing("end-of-request out of sequence".into()));
                }
                stream
                    .write(&Packet::EndRequest(EndRequestPacket {
                        code: u32::from(StepCode::CompleteOk.as_char()),
                        way: Way::Answer,
                        optional: None,
                    }))
                    .await?;
                machine.try_transition(SessionState::EndRequestRequested)?;
                machine.try_transition(SessionState::ClosedChannel)?;
                return Ok(target);
            }
            Packet::KeepAlive(ka) if ka.way == Way::Ask => {
                stream
                    .write(&Packet::KeepAlive(KeepAlivePacket { way: Way::Answer }))
                    .await?;
            }
            other => {
                return Err(Error::Framing(format!(
                    "unexpected packet during data phase: {other}"
                )));
            }
        }
    }
}

/// Drive a transfer from the requester side over an open channel.
///
/// Returns the outcome resolved when the session reaches a terminal state;
/// the record's status itself is finalized by the caller (the runner), as
/// the durable store is the requester's source of truth.
pub async fn run_requester(
    stream: &mut PacketStream,
    record: &mut TransferRecord,
    ctx: &SessionContext,
    local_id: i32,
) -> TransferOutcome {
    let mut machine = StateMachine::new();
    let result = drive_requester(stream, &mut machine, record, ctx, local_id).await;
    let outcome = match result {
        Ok(final_rank) => TransferOutcome::completed(final_rank),
        Err(error) => {
            tracing::warn!(
                transfer = %record.transfer_id_label(),
                error = %error,
                "Requester session failed"
            );
            report_failure(stream, &error).await;
            if let Some(rule) = ctx.rules.resolve(&record.rule_id) {
                if let Err(task_error) =
                    run_phase(ctx, record, &rule, GlobalStep::ErrorTask, None).await
                {
                    tracing::debug!(error = %task_error, "Error task failed");
                }
            }
            TransferOutcome::failed(error.step_code(), error.to_string(), record.rank)
        }
    };
    machine.release();
    outcome
}

async fn drive_requester(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    record: &mut TransferRecord,
    ctx: &SessionContext,
    local_id: i32,
) -> Result<u32> {
    let requester_sends = record.mode.is_send();
    let rule = ctx
        .rules
        .resolve(&record.rule_id)
        .ok_or_else(|| Error::RuleNotFound(record.rule_id.clone()))?;
    if !rule.mode.is_compatible(record.mode) {
        return Err(Error::RunnerConfig(format!(
            "rule '{}' direction does not admit mode {:?}",
            rule.rule_id, record.mode
        )));
    }

    machine.try_transition(SessionState::Startup)?;
    stream
        .write(&Packet::Startup(StartupPacket { local_id }))
        .await?;

    machine.try_transition(SessionState::AuthentRequester)?;
    stream
        .write(&Packet::Authent(AuthentPacket {
            host_id: ctx.host_id.clone(),
            key: ctx.host_key.clone().into_bytes(),
            local_id,
            way: Way::Ask,
            version: ctx.version.clone(),
        }))
        .await?;

    let packet = admit(machine, stream.read().await?, requester_sends)?;
    let Packet::Authent(answer) = packet else {
        return Err(Error::Framing(format!(
            "expected authentication answer, got {packet}"
        )));
    };
    if answer.way != Way::Answer {
        return Err(Error::BadAuthent(answer.host_id));
    }

    machine.try_transition(SessionState::RequestRequester)?;
    let original_size = if requester_sends {
        i64::try_from(
            tokio::fs::metadata(outbound_path(&rule, &record.original_filename)?)
                .await
                .map(|m| m.len())
                .unwrap_or(0),
        )
        .unwrap_or(-1)
    } else {
        -1
    };
    stream
        .write(&Packet::Request(RequestPacket {
            rule: record.rule_id.clone(),
            mode: record.mode,
            filename: record.original_filename.clone(),
            block_size: record.block_size,
            rank: record.rank,
            special_id: record.special_id,
            way: Way::Ask,
            code: StepCode::InitOk.as_char(),
            original_size,
            file_information: record.file_information.clone(),
        }))
        .await?;

    run_phase(ctx, record, &rule, GlobalStep::PreTask, None).await?;
    record.set_global_step(GlobalStep::Transfer);
    persist(ctx, record).await;

    let final_rank = if requester_sends {
        // request delivered; the peer streams nothing back before the data
        // phase in send mode
        machine.try_transition(SessionState::RequestRequested)?;
        let path = outbound_path(&rule, &record.original_filename)?;
        let mut file = BlockFile::open_read(&path, record.block_size).await?;
        send_blocks(
            stream,
            machine,
            record,
            ctx,
            &mut file,
            SessionState::DataRequester,
        )
        .await?;
        finish_as_sender(stream, machine, record, &file, requester_sends).await?;
        record.rank
    } else {
        // retrieve: the peer answers the request, then streams toward us
        let packet = admit(machine, stream.read().await?, requester_sends)?;
        let Packet::Request(answer) = packet else {
            return Err(Error::Framing(format!(
                "expected request answer, got {packet}"
            )));
        };
        if answer.way != Way::Answer {
            return Err(Error::Framing("request answered out of sequence".into()));
        }
        record.advance_rank(answer.rank);

        let basename = file_basename(&record.original_filename)?;
        let file = if record.rank > 0 {
            BlockFile::resume_write(&rule.work_path, &basename, record.block_size, record.rank)
                .await?
        } else {
            BlockFile::create_write(&rule.work_path, &basename, record.block_size).await?
        };
        let target = receive_blocks(
            stream,
            machine,
            record,
            ctx,
            &rule,
            file,
            SessionState::DataRequested,
            requester_sends,
        )
        .await?;
        tracing::info!(file = %target.display(), "Retrieved file finalized");
        record.rank
    };

    record.set_global_step(GlobalStep::AllDone);
    record.change_status(UpdatedInfo::Done, StepCode::CompleteOk);
    persist(ctx, record).await;
    Ok(final_rank)
}

/// Serve one inbound local channel on the requested host.
///
/// Reads packets until the channel closes, answering the handshake
/// sequence and running the transfer the peer asks for.
pub async fn serve_requested(mut stream: PacketStream, ctx: Arc<SessionContext>) {
    let mut machine = StateMachine::new();
    let result = drive_requested(&mut stream, &mut machine, &ctx).await;
    if let Err(error) = result {
        tracing::warn!(error = %error, "Inbound session failed");
        report_failure(&mut stream, &error).await;
    }
    machine.release();
}

struct InboundTransfer {
    record: TransferRecord,
    rule: RuleConfig,
    file: Option<BlockFile>,
    // held so the dedup key stays claimed for the life of the transfer
    _claim: ChannelClaim,
}

/// What an accepted request leaves behind: an inbound transfer awaiting
/// data, or a retrieve that already ran to completion.
enum Accepted {
    Inbound(InboundTransfer),
    RetrieveDone,
}

async fn drive_requested(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    ctx: &Arc<SessionContext>,
) -> Result<()> {
    let mut transfer: Option<InboundTransfer> = None;
    let outcome = requested_loop(stream, machine, ctx, &mut transfer).await;

    if let Err(error) = &outcome {
        if let Some(mut inbound) = transfer.take() {
            let rule = inbound.rule.clone();
            if let Err(task_error) = run_phase(
                ctx,
                &mut inbound.record,
                &rule,
                GlobalStep::ErrorTask,
                None,
            )
            .await
            {
                tracing::debug!(error = %task_error, "Error task failed");
            }
            inbound
                .record
                .change_status(UpdatedInfo::InError, error.step_code());
            persist(ctx, &inbound.record).await;
        }
    }
    outcome
}

#[allow(clippy::too_many_lines)]
async fn requested_loop(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    ctx: &Arc<SessionContext>,
    transfer: &mut Option<InboundTransfer>,
) -> Result<()> {
    let mut peer: Option<String> = None;
    // until the request arrives, the data direction is unknown; Data packets
    // cannot legally appear before it, so the placeholder is never consulted
    let mut requester_sends = true;

    loop {
        let packet = stream.read().await?;
        // a zero-block file still passes through the data phase
        if matches!(&packet, Packet::EndTransfer(e) if e.way == Way::Ask)
            && transfer.is_some()
            && machine.current() == SessionState::RequestRequested
        {
            let data_state = if requester_sends {
                SessionState::DataRequester
            } else {
                SessionState::DataRequested
            };
            machine.try_transition(data_state)?;
        }
        let packet = admit(machine, packet, requester_sends)?;

        match packet {
            Packet::Startup(p) => {
                tracing::debug!(local_id = p.local_id, "Channel startup");
            }
            Packet::Authent(authent) => {
                if authent.way != Way::Ask {
                    return Err(Error::BadAuthent(authent.host_id));
                }
                let Some(known) = ctx.hosts.resolve(&authent.host_id) else {
                    return Err(Error::BadAuthent(authent.host_id));
                };
                if known.key.as_bytes() != authent.key.as_slice() {
                    return Err(Error::BadAuthent(authent.host_id));
                }
                machine.try_transition(SessionState::AuthentRequested)?;
                stream
                    .write(&Packet::Authent(AuthentPacket {
                        host_id: ctx.host_id.clone(),
                        key: ctx.host_key.clone().into_bytes(),
                        local_id: authent.local_id,
                        way: Way::Answer,
                        version: ctx.version.clone(),
                    }))
                    .await?;
                tracing::info!(peer = %authent.host_id, "Peer authenticated");
                peer = Some(authent.host_id);
            }
            Packet::Request(request) => {
                let Some(peer_id) = peer.clone() else {
                    return Err(Error::BadAuthent("unauthenticated request".into()));
                };
                if request.way != Way::Ask {
                    return Err(Error::Framing("request answer without ask".into()));
                }
                if ctx.blocked.load(Ordering::SeqCst) {
                    return Err(Error::RunnerConfig(
                        "host is not accepting new requests".into(),
                    ));
                }
                requester_sends = request.mode.is_send();
                match accept_request(stream, machine, ctx, &peer_id, &request).await? {
                    Accepted::Inbound(inbound) => *transfer = Some(inbound),
                    Accepted::RetrieveDone => return Ok(()),
                }
            }
            Packet::Data(data) => {
                let Some(inbound) = transfer.as_mut() else {
                    return Err(Error::Framing("data before request".into()));
                };
                let record = &mut inbound.record;
                if data.rank != record.rank {
                    return Err(Error::Framing(format!(
                        "out-of-order block {} while expecting {}",
                        data.rank, record.rank
                    )));
                }
                if record.mode.is_integrity_checked() && !data.is_key_valid() {
                    return Err(Error::DataIntegrity { rank: data.rank });
                }
                let Some(file) = inbound.file.as_mut() else {
                    return Err(Error::Internal("no work file for data phase".into()));
                };
                file.write_block(&data.data).await?;
                record.advance_rank(data.rank + 1);
                persist(ctx, record).await;
            }
            Packet::EndTransfer(end) => {
                if end.way != Way::Ask {
                    return Err(Error::Framing("unsolicited end-of-transfer answer".into()));
                }
                let Some(inbound) = transfer.as_mut() else {
                    return Err(Error::Framing("end-of-transfer before request".into()));
                };
                let Some(mut file) = inbound.file.take() else {
                    return Err(Error::Internal("no work file to finalize".into()));
                };
                file.flush().await?;
                if let Some(expected_digest) = &end.digest {
                    let actual = file.sha256_hex().await?;
                    if &actual != expected_digest {
                        return Err(Error::DataIntegrity {
                            rank: inbound.record.rank,
                        });
                    }
                }
                let rule = inbound.rule.clone();
                run_phase(
                    ctx,
                    &mut inbound.record,
                    &rule,
                    GlobalStep::PostTask,
                    Some(file.path().to_path_buf()),
                )
                .await?;
                let final_name = file_basename(&inbound.record.filename)?;
                let target = file.rename_to_final(&rule.recv_path, &final_name).await?;
                inbound.record.filename = target.display().to_string();
                stream
                    .write(&Packet::EndTransfer(EndTransferPacket {
                        request: PacketType::Request as u8,
                        way: Way::Answer,
                        digest: None,
                    }))
                    .await?;
                machine.try_transition(SessionState::EndTransferRequested)?;
            }
            Packet::EndRequest(end) => {
                if end.way != Way::Ask {
                    return Err(Error::Framing("unsolicited end-of-request answer".into()));
                }
                stream
                    .write(&Packet::EndRequest(EndRequestPacket {
                        code: u32::from(StepCode::CompleteOk.as_char()),
                        way: Way::Answer,
                        optional: None,
                    }))
                    .await?;
                machine.try_transition(SessionState::EndRequestRequested)?;
                machine.try_transition(SessionState::ClosedChannel)?;
                if let Some(mut inbound) = transfer.take() {
                    inbound.record.set_global_step(GlobalStep::AllDone);
                    inbound
                        .record
                        .change_status(UpdatedInfo::Done, StepCode::CompleteOk);
                    persist(ctx, &inbound.record).await;
                }
                return Ok(());
            }
            Packet::KeepAlive(ka) => {
                if ka.way == Way::Ask {
                    stream
                        .write(&Packet::KeepAlive(KeepAlivePacket { way: Way::Answer }))
                        .await?;
                }
            }
            Packet::Test(mut test) => {
                if test.is_exhausted() {
                    stream
                        .write(&Packet::Valid(ValidPacket {
                            info: test.info,
                            extra: test.extra,
                            of_type: PacketType::Test as u8,
                        }))
                        .await?;
                    machine.try_transition(SessionState::ValidOther)?;
                } else {
                    test.update();
                    stream.write(&Packet::Test(test)).await?;
                }
            }
            Packet::Information(info) => {
                let records = ctx.store.all().await?;
                let matching = records
                    .iter()
                    .filter(|r| r.rule_id == info.rule)
                    .count();
                stream
                    .write(&Packet::Valid(ValidPacket {
                        info: format!("{matching} transfers for rule {}", info.rule),
                        extra: String::new(),
                        of_type: PacketType::Information as u8,
                    }))
                    .await?;
                machine.try_transition(SessionState::ValidOther)?;
            }
            Packet::Shutdown(shutdown) => {
                if shutdown.key != ctx.host_key.as_bytes() {
                    return Err(Error::BadAuthent("shutdown key rejected".into()));
                }
                tracing::warn!("Shutdown requested through the protocol");
                ctx.shutdown.store(true, Ordering::SeqCst);
                machine.try_transition(SessionState::ClosedChannel)?;
                return Ok(());
            }
            Packet::BlockRequest(block) => {
                if block.key != ctx.host_key.as_bytes() {
                    return Err(Error::BadAuthent("block request key rejected".into()));
                }
                ctx.blocked.store(block.block, Ordering::SeqCst);
                stream
                    .write(&Packet::Valid(ValidPacket {
                        info: format!("requests blocked: {}", block.block),
                        extra: String::new(),
                        of_type: PacketType::BlockRequest as u8,
                    }))
                    .await?;
            }
            Packet::BusinessRequest(mut business) => {
                if business.way != Way::Ask {
                    continue;
                }
                let hook_ctx = TaskContext {
                    record: transfer
                        .as_ref()
                        .map_or_else(|| placeholder_record(ctx), |t| t.record.clone()),
                    step: GlobalStep::NoTask,
                    file_path: None,
                };
                run_step_tasks(
                    &ctx.tasks,
                    &[crate::directory::TaskSpec {
                        name: "business".to_string(),
                        argument: business.payload.clone(),
                    }],
                    &hook_ctx,
                )
                .await?;
                business.way = Way::Answer;
                stream.write(&Packet::BusinessRequest(business)).await?;
            }
            Packet::JsonCommand(mut command) => {
                command.result = "{\"status\":\"ok\"}".to_string();
                stream.write(&Packet::JsonCommand(command)).await?;
            }
            Packet::Valid(valid) => {
                tracing::debug!(envelope = %Packet::Valid(valid), "Ignoring validation envelope");
            }
            Packet::NoOp => {}
            Packet::Error(_) | Packet::ConnectionError(_) => {
                return Err(Error::Internal("peer error escaped admission".into()));
            }
        }
    }
}

fn placeholder_record(ctx: &SessionContext) -> TransferRecord {
    TransferRecord::new(
        "none",
        &ctx.host_id,
        &ctx.host_id,
        crate::record::TransferMode::Unknown,
        "none",
        crate::config::MIN_BLOCK_SIZE,
    )
}

/// Validate an inbound transfer request, set up the record and, for a
/// retrieve, stream the file back immediately.
async fn accept_request(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    ctx: &Arc<SessionContext>,
    peer_id: &str,
    request: &RequestPacket,
) -> Result<Accepted> {
    let rule = ctx
        .rules
        .resolve(&request.rule)
        .ok_or_else(|| Error::RuleNotFound(request.rule.clone()))?;
    if !rule.admits(peer_id) {
        return Err(Error::RunnerConfig(format!(
            "host '{peer_id}' may not use rule '{}'",
            rule.rule_id
        )));
    }
    if !rule.mode.is_compatible(request.mode) {
        return Err(Error::RunnerConfig(format!(
            "rule '{}' direction does not admit mode {:?}",
            rule.rule_id, request.mode
        )));
    }

    let basename = file_basename(&request.filename)?;
    let mut record = TransferRecord::new(
        &request.rule,
        peer_id,
        &ctx.host_id,
        request.mode,
        &basename,
        request.block_size.max(crate::config::MIN_BLOCK_SIZE),
    );
    record.original_filename.clone_from(&request.filename);
    record.file_information.clone_from(&request.file_information);
    record.rank = request.rank;
    record.special_id = request.special_id;
    record.change_status(UpdatedInfo::Running, StepCode::Running);

    let claim = ctx
        .active
        .try_claim(&record.dedup_key())
        .ok_or_else(|| Error::RunnerConfig("transfer already in flight".into()))?;

    match ctx.store.select(record.special_id).await? {
        Some(_) => ctx.store.update(&record).await?,
        None => {
            record.special_id = ctx.store.insert(record.clone()).await?;
        }
    }

    if let Err(error) = run_phase(ctx, &mut record, &rule, GlobalStep::PreTask, None).await {
        record.change_status(UpdatedInfo::InError, error.step_code());
        persist(ctx, &record).await;
        return Err(error);
    }
    record.set_global_step(GlobalStep::Transfer);
    persist(ctx, &record).await;

    if request.mode.is_send() {
        // the requester streams toward us; open the landing file
        machine.try_transition(SessionState::RequestRequested)?;
        let file = if request.rank > 0 {
            BlockFile::resume_write(&rule.work_path, &basename, record.block_size, request.rank)
                .await?
        } else {
            BlockFile::create_write(&rule.work_path, &basename, record.block_size).await?
        };
        Ok(Accepted::Inbound(InboundTransfer {
            record,
            rule,
            file: Some(file),
            _claim: claim,
        }))
    } else {
        // retrieve: answer the request, then stream the file back
        match retrieve_outbound(stream, machine, ctx, &rule, &mut record, request).await {
            Ok(()) => {
                record.set_global_step(GlobalStep::AllDone);
                record.change_status(UpdatedInfo::Done, StepCode::CompleteOk);
                persist(ctx, &record).await;
                drop(claim);
                Ok(Accepted::RetrieveDone)
            }
            Err(error) => {
                if let Err(task_error) =
                    run_phase(ctx, &mut record, &rule, GlobalStep::ErrorTask, None).await
                {
                    tracing::debug!(error = %task_error, "Error task failed");
                }
                record.change_status(UpdatedInfo::InError, error.step_code());
                persist(ctx, &record).await;
                drop(claim);
                Err(error)
            }
        }
    }
}

/// The data-out half of a retrieve: answer the request, stream the file,
/// run the end handshake.
async fn retrieve_outbound(
    stream: &mut PacketStream,
    machine: &mut StateMachine,
    ctx: &Arc<SessionContext>,
    rule: &RuleConfig,
    record: &mut TransferRecord,
    request: &RequestPacket,
) -> Result<()> {
    machine.try_transition(SessionState::RequestRequested)?;
    let mut answer = request.clone();
    answer.way = Way::Answer;
    answer.special_id = record.special_id;
    stream.write(&Packet::Request(answer)).await?;

    let path = outbound_path(rule, &request.filename)?;
    let mut file = BlockFile::open_read(&path, record.block_size).await?;
    send_blocks(
        stream,
        machine,
        record,
        ctx,
        &mut file,
        SessionState::DataRequested,
    )
    .await?;
    finish_as_sender(stream, machine, record, &file, false).await
}
