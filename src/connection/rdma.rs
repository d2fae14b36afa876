//! # RDMA
//! ibverbs implementation of [`TransportProvider`]. Talks to the first device found, port 1,
//! with one completion queue shared by every endpoint.
//!
//! The raw verbs are used instead of the safe `ibverbs` wrappers because every queue pair
//! transition has to be issued on its own, with its own attribute mask.
use crate::connection::mapping::Backing;
use crate::connection::{Address, EndpointHandle, ReadRequest, RegisteredRegion, TransportProvider};
use crate::endpoint::StateChange;
use crate::error::{Error, Result};
use ibverbs::ffi;
use std::collections::HashMap;
use std::io;
use std::ptr;
use tracing::{debug, info, warn};

const PORT_NUM: u8 = 1;
pub const DEFAULT_MAX_OUTSTANDING: usize = 10;

struct IbvRegion {
    mr: *mut ffi::ibv_mr,
    // keeps the registered bytes alive; dropped after the MR is deregistered
    _backing: Backing,
}

/// Holds all of the verbs context for one process
pub struct IbvProvider {
    regions: HashMap<usize, IbvRegion>,
    qps: HashMap<u32, *mut ffi::ibv_qp>,
    next_region: usize,
    max_outstanding: usize,
    cq: *mut ffi::ibv_cq,
    pd: *mut ffi::ibv_pd,
    ctx: *mut ffi::ibv_context,
}

fn last_os_error() -> String {
    io::Error::last_os_error().to_string()
}

impl IbvProvider {
    /// Opens the first RDMA device and sets up its protection domain and completion queue.
    pub fn open(max_outstanding: usize) -> Result<IbvProvider> {
        unsafe {
            let mut num_devices = 0;
            let devices = ffi::ibv_get_device_list(&mut num_devices);
            if devices.is_null() {
                return Err(Error::transport("ibv_get_device_list", last_os_error()));
            }
            if num_devices == 0 {
                ffi::ibv_free_device_list(devices);
                return Err(Error::transport("ibv_get_device_list", "no RDMA devices found"));
            }

            let dev = *devices;
            let name = std::ffi::CStr::from_ptr(ffi::ibv_get_device_name(dev))
                .to_string_lossy()
                .into_owned();
            let ctx = ffi::ibv_open_device(dev);
            ffi::ibv_free_device_list(devices);
            if ctx.is_null() {
                return Err(Error::transport("ibv_open_device", last_os_error()));
            }

            let pd = ffi::ibv_alloc_pd(ctx);
            if pd.is_null() {
                let reason = last_os_error();
                ffi::ibv_close_device(ctx);
                return Err(Error::transport("ibv_alloc_pd", reason));
            }

            let cq = ffi::ibv_create_cq(
                ctx,
                max_outstanding as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            );
            if cq.is_null() {
                let reason = last_os_error();
                ffi::ibv_dealloc_pd(pd);
                ffi::ibv_close_device(ctx);
                return Err(Error::transport("ibv_create_cq", reason));
            }
            info!("opened RDMA device {}", name);

            Ok(IbvProvider {
                regions: HashMap::new(),
                qps: HashMap::new(),
                next_region: 0,
                max_outstanding,
                cq,
                pd,
                ctx,
            })
        }
    }

    fn qp(&self, endpoint: EndpointHandle) -> Result<*mut ffi::ibv_qp> {
        self.qps
            .get(&endpoint.0)
            .copied()
            .ok_or_else(|| Error::transport("qp lookup", format!("no endpoint {}", endpoint.0)))
    }
}

impl TransportProvider for IbvProvider {
    fn name(&self) -> &'static str {
        "rdma"
    }

    fn register_region(
        &mut self,
        size: usize,
        placement: Option<Address>,
    ) -> Result<RegisteredRegion> {
        let mut backing = Backing::allocate(size, placement)?;
        let access = ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ;

        let mr = unsafe {
            ffi::ibv_reg_mr(
                self.pd,
                backing.as_mut_ptr() as *mut _,
                backing.len(),
                access.0 as i32,
            )
        };
        if mr.is_null() {
            return Err(Error::transport("ibv_reg_mr", last_os_error()));
        }

        let id = self.next_region;
        self.next_region += 1;
        let region = unsafe {
            RegisteredRegion {
                id,
                base_address: (*mr).addr as Address,
                size_bytes: size as u32,
                local_key: (*mr).lkey,
                remote_key: (*mr).rkey,
            }
        };
        self.regions.insert(id, IbvRegion { mr, _backing: backing });

        Ok(region)
    }

    fn deregister_region(&mut self, region: RegisteredRegion) -> Result<()> {
        let r = self
            .regions
            .remove(&region.id)
            .ok_or_else(|| {
                Error::transport(
                    "ibv_dereg_mr",
                    format!("region {} is not registered", region.id),
                )
            })?;

        let rc = unsafe { ffi::ibv_dereg_mr(r.mr) };
        if rc != 0 {
            return Err(Error::transport("ibv_dereg_mr", io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    fn create_endpoint(&mut self) -> Result<EndpointHandle> {
        unsafe {
            let mut init: ffi::ibv_qp_init_attr = std::mem::zeroed();
            init.send_cq = self.cq;
            init.recv_cq = self.cq;
            init.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
            init.cap.max_send_wr = self.max_outstanding as u32;
            init.cap.max_recv_wr = 1;
            init.cap.max_send_sge = 1;
            init.cap.max_recv_sge = 1;
            init.sq_sig_all = 1;

            let qp = ffi::ibv_create_qp(self.pd, &mut init);
            if qp.is_null() {
                return Err(Error::transport("ibv_create_qp", last_os_error()));
            }
            let num = (*qp).qp_num;
            self.qps.insert(num, qp);

            Ok(EndpointHandle(num))
        }
    }

    fn destroy_endpoint(&mut self, endpoint: EndpointHandle) -> Result<()> {
        let qp = self.qp(endpoint)?;
        self.qps.remove(&endpoint.0);

        let rc = unsafe { ffi::ibv_destroy_qp(qp) };
        if rc != 0 {
            return Err(Error::transport("ibv_destroy_qp", io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    fn modify_endpoint(&mut self, endpoint: EndpointHandle, change: &StateChange) -> Result<()> {
        let qp = self.qp(endpoint)?;
        let mut attr: ffi::ibv_qp_attr = unsafe { std::mem::zeroed() };

        match change {
            StateChange::Init(a) => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_INIT;
                attr.qp_access_flags = a.access.0;
                attr.pkey_index = a.pkey_index;
                attr.port_num = a.port_num;
            }
            StateChange::ReadyToReceive(a) => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = a.path_mtu as _;
                attr.dest_qp_num = a.dest_endpoint;
                attr.rq_psn = a.rq_psn;
                attr.max_dest_rd_atomic = a.max_dest_rd_atomic;
                attr.min_rnr_timer = a.min_rnr_timer;
                attr.ah_attr.is_global = 0;
                attr.ah_attr.dlid = a.dest_port_id;
                attr.ah_attr.sl = 0;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = a.port_num;
            }
            StateChange::ReadyToSend(a) => {
                attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTS;
                attr.timeout = a.timeout;
                attr.retry_cnt = a.retry_cnt;
                attr.rnr_retry = a.rnr_retry;
                attr.sq_psn = a.sq_psn;
                attr.max_rd_atomic = a.max_rd_atomic;
            }
        }

        let mask = change.mask();
        debug!("ibv_modify_qp {} -> {} mask {:#x}", endpoint.0, change.target(), mask.bits());
        let rc = unsafe { ffi::ibv_modify_qp(qp, &mut attr, mask.bits() as i32) };
        if rc != 0 {
            return Err(Error::transport(
                "ibv_modify_qp",
                format!("to {}: {}", change.target(), io::Error::from_raw_os_error(rc)),
            ));
        }
        Ok(())
    }

    fn local_port_id(&self) -> Result<u16> {
        unsafe {
            let mut port_attr: ffi::ibv_port_attr = std::mem::zeroed();
            let attr = &mut port_attr as *mut ffi::ibv_port_attr;
            let rc = ffi::ibv_query_port(self.ctx, PORT_NUM, attr as *mut _);
            if rc != 0 {
                return Err(Error::transport("ibv_query_port", io::Error::from_raw_os_error(rc)));
            }
            Ok(port_attr.lid)
        }
    }

    fn post_read(&mut self, endpoint: EndpointHandle, request: &ReadRequest) -> Result<()> {
        let qp = self.qp(endpoint)?;

        unsafe {
            let mut sge: ffi::ibv_sge = std::mem::zeroed();
            sge.addr = request.local_address;
            sge.length = request.len;
            sge.lkey = request.local_key;

            let mut wr: ffi::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = request.wr_id;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.opcode = ffi::ibv_wr_opcode::IBV_WR_RDMA_READ;
            wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
            wr.wr.rdma.remote_addr = request.remote_address;
            wr.wr.rdma.rkey = request.remote_key;

            let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();
            let ctx = (*qp).context;
            let post_send = (*ctx)
                .ops
                .post_send
                .ok_or_else(|| Error::transport("post_send", "provider has no post_send"))?;
            let rc = post_send(qp, &mut wr, &mut bad_wr);
            if rc != 0 {
                return Err(Error::transport("post_send", io::Error::from_raw_os_error(rc)));
            }
        }
        Ok(())
    }

    fn drain(&mut self, n: usize) -> Result<usize> {
        let mut completions = vec![ffi::ibv_wc::default(); n.max(1)];
        let poll_cq = unsafe { (*self.ctx).ops.poll_cq }
            .ok_or_else(|| Error::transport("poll_cq", "provider has no poll_cq"))?;

        let mut done = 0;
        while done < n {
            let got = unsafe { poll_cq(self.cq, (n - done) as i32, completions.as_mut_ptr()) };
            if got < 0 {
                return Err(Error::transport("poll_cq", format!("returned {}", got)));
            }
            for wc in &completions[..got as usize] {
                if let Some((status, vendor_err)) = wc.error() {
                    return Err(Error::transport(
                        "poll_cq",
                        format!(
                            "work request {} completed with {:?} (vendor error {:#x})",
                            wc.wr_id(),
                            status,
                            vendor_err
                        ),
                    ));
                }
            }
            done += got as usize;
            if got == 0 {
                std::hint::spin_loop();
            }
        }

        Ok(done)
    }

    fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }
}

impl Drop for IbvProvider {
    fn drop(&mut self) {
        unsafe {
            for (num, qp) in self.qps.drain() {
                warn!("endpoint {} still open at shutdown", num);
                ffi::ibv_destroy_qp(qp);
            }
            for (id, r) in self.regions.drain() {
                warn!("region {} still registered at shutdown", id);
                ffi::ibv_dereg_mr(r.mr);
            }
            ffi::ibv_destroy_cq(self.cq);
            ffi::ibv_dealloc_pd(self.pd);
            ffi::ibv_close_device(self.ctx);
        }
    }
}
