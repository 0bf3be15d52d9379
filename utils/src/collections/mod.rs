pub mod fast_lazy_static;
