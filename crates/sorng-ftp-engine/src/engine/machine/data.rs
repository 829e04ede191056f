//! PASV / PORT.

use super::*;
use crate::engine::reply::parse_pasv_reply;

impl Run<'_, '_> {
    /// Prepare a data connection for `purpose`, then continue with the
    /// transfer command.
    pub(super) fn alloc_data(&mut self, purpose: DataPurpose) {
        self.job.reset_transfer();
        self.job.data_for = purpose;
        if self.env.config.use_passive_mode && self.env.caps.passive_supported() {
            self.send(Command::Pasv, SubState::DataPasv);
        } else {
            self.listen();
        }
    }

    fn listen(&mut self) {
        self.core.data_open = true;
        self.effect(Effect::Listen);
        self.enter(SubState::DataListen);
    }

    pub(super) fn on_pasv(&mut self, reply: Reply) {
        let addr = if reply.is_success() {
            parse_pasv_reply(&reply.text()).ok()
        } else {
            None
        };
        match addr {
            Some(addr) => {
                self.job.data_target = Some(DataTarget::Passive(addr));
                self.data_ready();
            }
            None => {
                self.env.caps.set_passive_unsupported();
                self.log_info("Passive mode failed, trying active mode");
                self.listen();
            }
        }
    }

    pub(super) fn on_listening(&mut self, addr: SocketAddr) {
        if self.core.sub != SubState::DataListen {
            return;
        }
        match addr {
            SocketAddr::V4(v4) => self.send(Command::Port(v4), SubState::DataPort),
            SocketAddr::V6(_) => self.fail(
                ProblemCode::ListenFailure,
                None,
                Some("PORT needs an IPv4 address".into()),
            ),
        }
    }

    pub(super) fn on_port(&mut self, reply: Reply) {
        if reply.is_success() {
            self.job.data_target = Some(DataTarget::Active);
            self.data_ready();
        } else {
            self.fail(ProblemCode::ListenFailure, None, Some(reply.text()));
        }
    }

    fn data_ready(&mut self) {
        match self.job.data_for {
            DataPurpose::Store => self.send_store(),
            DataPurpose::Retrieve => self.send_rest_or_retr(),
            DataPurpose::List => self.send_list(),
        }
    }

    /// Send the transfer command and open the data connection.
    pub(super) fn start_transfer(&mut self, cmd: Command, sub: SubState) {
        let Some(target) = self.job.data_target else {
            self.fail(ProblemCode::ListenFailure, None, None);
            return;
        };
        self.send(cmd, sub);
        self.core.data_open = true;
        self.effect(Effect::ActivateData(target));
    }
}
