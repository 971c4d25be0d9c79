use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Accepts TCP connections for the worker threads of the binary.
///
/// The listener is blocking; each worker calls [`ConnectionAcceptor::accept`]
/// on a shared acceptor and the kernel hands every connection to exactly
/// one of them.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    connection_count: AtomicUsize,
}

impl ConnectionAcceptor {
    /// Create a new connection acceptor bound to the specified address
    pub fn new<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "No socket addresses found")
        })?;

        let socket = Self::create_socket(&socket_addr)?;

        Ok(Self {
            listener: socket.into(),
            connection_count: AtomicUsize::new(0),
        })
    }

    /// Accept a new connection
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept()?;
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Get the local address this acceptor is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    fn create_socket(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&(*addr).into())?;
        socket.listen(1024)?;

        Ok(socket)
    }
}
