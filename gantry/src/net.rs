/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */
use miette::{Context, IntoDiagnostic, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, TcpListener};

/// Opens a non-blocking listening socket for the reverse proxy.
pub fn init_server_socket(addr: SocketAddr) -> Result<TcpListener> {
    listen(addr, false).wrap_err_with(|| format!("could not bind reverse proxy to {addr}"))
}

/// Opens a non-blocking listening socket that other processes may bind as well. The kernel
/// distributes incoming connections among all sockets bound to the address.
pub fn init_shared_socket(addr: SocketAddr) -> Result<TcpListener> {
    listen(addr, true).wrap_err_with(|| format!("could not bind worker to {addr}"))
}

fn listen(addr: SocketAddr, shared: bool) -> Result<TcpListener> {
    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).into_diagnostic()?;

    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_address(true).into_diagnostic()?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if shared {
        socket.set_reuse_port(true).into_diagnostic()?;
    }
    socket.set_nonblocking(true).into_diagnostic()?;
    socket.set_tcp_nodelay(true).into_diagnostic()?;
    socket.bind(&SockAddr::from(addr)).into_diagnostic()?;
    socket.listen(1024).into_diagnostic()?;
    let listener = socket.into();

    Ok(listener)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_sockets_bind_the_same_address() {
        let first = init_shared_socket("127.0.0.1:0".parse().expect("invalid address"))
            .expect("could not bind first socket");
        let addr = first.local_addr().expect("no local address");

        let second = init_shared_socket(addr).expect("could not bind second socket");
        assert_eq!(second.local_addr().expect("no local address"), addr);
    }

    #[test]
    fn exclusive_socket_rejects_second_bind() {
        let first = init_server_socket("127.0.0.1:0".parse().expect("invalid address"))
            .expect("could not bind first socket");
        let addr = first.local_addr().expect("no local address");

        assert!(init_server_socket(addr).is_err());
    }
}
