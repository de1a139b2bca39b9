pub mod hmm_controls;
